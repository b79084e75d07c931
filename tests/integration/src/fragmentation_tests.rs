//! Multi-fragment responses
//!
//! Exercises reassembly on plain and sealed channels together with the
//! ways a fragment stream can go wrong: a misplaced FIRST_FRAG, a fault
//! mid-call, and a fragment for somebody else's call.

use dcerpc_np::{
    bind, pipes, CallError, ChannelConfig, FaultStatus, Flags, PacketFlags, ProtocolError,
    DEFAULT_MAX_FRAG,
};
use integration_tests::*;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// Reassembly
// ============================================================================

#[tokio::test]
async fn test_three_fragment_response() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let payload = pattern(9000);
    let expected = payload.clone();

    let server_task = tokio::spawn(async move {
        server.accept_bind(pipes::SRVSVC.server_pipe).await;
        let request = server.read_request().await;
        let call_id = request.header.call_id;
        server
            .respond_fragments(
                call_id,
                &[&payload[..4096], &payload[4096..8192], &payload[8192..]],
            )
            .await;
    });

    let config = ChannelConfig::for_pipe(&pipes::SRVSVC);
    let mut channel = bind(pipe, &config, None).await.unwrap();
    assert_eq!(channel.max_recv_frag(), DEFAULT_MAX_FRAG);

    let reply = channel.call(0x0f, &[0u8; 12]).await.unwrap();
    assert_eq!(reply.len(), 9000);
    assert_eq!(&reply[..], &expected[..]);
    assert!(!channel.is_poisoned());
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_two_fragment_response() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let payload = pattern(3000);
    let expected = payload.clone();

    let server_task = tokio::spawn(async move {
        server.accept_bind(pipes::WKSSVC.server_pipe).await;
        let call_id = server.read_request().await.header.call_id;
        server
            .respond_fragments(call_id, &[&payload[..2000], &payload[2000..]])
            .await;
    });

    let config = ChannelConfig::for_pipe(&pipes::WKSSVC);
    let mut channel = bind(pipe, &config, None).await.unwrap();

    let reply = channel.call(0x00, b"info").await.unwrap();
    assert_eq!(&reply[..], &expected[..]);
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_signed_two_fragment_response() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    // odd split so both fragments carry auth padding
    let payload = pattern(2999);
    let expected = payload.clone();

    let server_task = tokio::spawn(async move {
        server
            .accept_authenticated_bind(
                pipes::LSARPC.server_pipe,
                Flags::NEGOTIATE_NTLM | Flags::NEGOTIATE_SIGN,
                [0x11; 8],
            )
            .await;
        let call_id = server.read_request().await.header.call_id;
        server
            .respond_fragments(call_id, &[&payload[..1501], &payload[1501..]])
            .await;
        server
    });

    let credentials = TestCredentials::new();
    let config = ChannelConfig::for_pipe(&pipes::LSARPC);
    let mut channel = bind(pipe, &config, Some(&credentials)).await.unwrap();
    assert!(channel.is_signing());

    let reply = channel.call(0x2c, b"lookup").await.unwrap();
    assert_eq!(&reply[..], &expected[..]);

    // one request and two response fragments
    let server = server_task.await.unwrap();
    assert_eq!(server.sealer().unwrap().seq_num(), 3);
}

#[tokio::test]
async fn test_sealed_multi_fragment_response() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let payload = pattern(5001);
    let expected = payload.clone();

    let server_task = tokio::spawn(async move {
        server
            .accept_authenticated_bind(
                pipes::WINREG.server_pipe,
                Flags::NEGOTIATE_NTLM | Flags::NEGOTIATE_SIGN | Flags::NEGOTIATE_SEAL,
                [9, 8, 7, 6, 5, 4, 3, 2],
            )
            .await;
        let request = server.read_request().await;
        let chunks: Vec<&[u8]> = payload.chunks(1023).collect();
        server.respond_fragments(request.header.call_id, &chunks).await;

        // the channel stays in step for the next call
        let request = server.read_request().await;
        server.respond(request.header.call_id, b"done").await;
    });

    let credentials = TestCredentials::new();
    let config = ChannelConfig::for_pipe(&pipes::WINREG);
    let mut channel = bind(pipe, &config, Some(&credentials)).await.unwrap();

    let reply = channel.call(0x11, b"enumerate").await.unwrap();
    assert_eq!(&reply[..], &expected[..]);
    assert_eq!(&channel.call(0x05, b"close").await.unwrap()[..], b"done");
    server_task.await.unwrap();
}

// ============================================================================
// Broken fragment streams
// ============================================================================

#[tokio::test]
async fn test_first_flag_on_third_fragment() {
    init_logging();
    let (pipe, mut server) = pipe_pair();

    let server_task = tokio::spawn(async move {
        server.accept_bind(pipes::SRVSVC.server_pipe).await;
        let call_id = server.read_request().await.header.call_id;
        for flags in [
            PacketFlags::fragment(true, false),
            PacketFlags::fragment(false, false),
            PacketFlags::fragment(true, true),
        ] {
            let fragment = server.response_fragment(call_id, &[0x55; 100], flags);
            server.send(&fragment).await;
        }
    });

    let config = ChannelConfig::for_pipe(&pipes::SRVSVC);
    let mut channel = bind(pipe, &config, None).await.unwrap();

    let err = channel.call(0x10, b"list").await.unwrap_err();
    assert!(matches!(err, CallError::Desync(_)), "got {:?}", err);
    assert!(channel.is_poisoned());
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_fault_after_first_fragment() {
    init_logging();
    let (pipe, mut server) = pipe_pair();

    let server_task = tokio::spawn(async move {
        server.accept_bind(pipes::WKSSVC.server_pipe).await;
        let call_id = server.read_request().await.header.call_id;
        let fragment = server.response_fragment(call_id, &[1; 64], PacketFlags::fragment(true, false));
        server.send(&fragment).await;
        server.fault(call_id, 5).await;
    });

    let config = ChannelConfig::for_pipe(&pipes::WKSSVC);
    let mut channel = bind(pipe, &config, None).await.unwrap();

    let err = channel.call(0x00, b"info").await.unwrap_err();
    assert!(matches!(err, CallError::Fault(5)));
    assert!(channel.is_poisoned());
    assert!(matches!(
        channel.call(0x00, b"info").await,
        Err(CallError::Poisoned)
    ));
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_fault_poisons_signed_channel() {
    init_logging();
    let (pipe, mut server) = pipe_pair();

    let server_task = tokio::spawn(async move {
        server
            .accept_authenticated_bind(
                pipes::NETLOGON.server_pipe,
                Flags::NEGOTIATE_NTLM | Flags::NEGOTIATE_SIGN,
                [0xa0; 8],
            )
            .await;
        let call_id = server.read_request().await.header.call_id;
        server.fault(call_id, FaultStatus::OpRngError as u32).await;
    });

    let credentials = TestCredentials::new();
    let config = ChannelConfig::for_pipe(&pipes::NETLOGON);
    let mut channel = bind(pipe, &config, Some(&credentials)).await.unwrap();

    let err = channel.call(0x02, b"logon").await.unwrap_err();
    assert!(matches!(err, CallError::Fault(0x1c01_0002)));
    assert!(channel.is_poisoned());
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_response_for_another_call() {
    init_logging();
    let (pipe, mut server) = pipe_pair();

    let server_task = tokio::spawn(async move {
        server.accept_bind(pipes::SRVSVC.server_pipe).await;
        let call_id = server.read_request().await.header.call_id;
        server.respond(call_id + 5, b"stray").await;
    });

    let config = ChannelConfig::for_pipe(&pipes::SRVSVC);
    let mut channel = bind(pipe, &config, None).await.unwrap();

    let err = channel.call(0x0f, b"x").await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Protocol(ProtocolError::CallIdMismatch {
            expected: 2,
            got: 7
        })
    ));
    assert!(channel.is_poisoned());
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_oversized_request_is_refused_locally() {
    init_logging();
    let (pipe, mut server) = pipe_pair();

    let server_task = tokio::spawn(async move {
        server.accept_bind(pipes::SRVSVC.server_pipe).await;
        let request = server.read_request().await;
        assert_eq!(request.stub_data.len(), 16);
        server.respond(request.header.call_id, b"small").await;
    });

    let config = ChannelConfig::builder(pipes::SRVSVC.abstract_syntax)
        .expected_secondary_address(pipes::SRVSVC.server_pipe)
        .max_frag(1024, 1024)
        .build();
    let mut channel = bind(pipe, &config, None).await.unwrap();
    assert_eq!(channel.max_xmit_frag(), 1024);

    let err = channel.call(0x01, &[0u8; 2000]).await.unwrap_err();
    assert!(matches!(err, CallError::RequestTooLarge { max: 1024, .. }));
    assert!(!channel.is_poisoned());

    // nothing reached the pipe, so the next call id is still 2
    assert_eq!(channel.next_call_id(), 2);
    assert_eq!(&channel.call(0x01, &[0u8; 16]).await.unwrap()[..], b"small");
    server_task.await.unwrap();
}
