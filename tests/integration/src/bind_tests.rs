//! Bind negotiation end to end

use bytes::Bytes;
use dcerpc_np::{
    bind, pipes, AuthLevel, AuthType, AuthVerifier, BindAckPdu, BindError, ChannelConfig, Pdu,
    DEFAULT_MAX_FRAG,
};
use integration_tests::*;

// ============================================================================
// Accepted binds
// ============================================================================

#[tokio::test]
async fn test_every_well_known_pipe_binds() {
    init_logging();

    for pipe_info in pipes::WELL_KNOWN_PIPES {
        let (pipe, mut server) = pipe_pair();
        let server_task = tokio::spawn(async move {
            let bind = server.accept_bind(pipe_info.server_pipe).await;
            let request = server.read_request().await;
            server.respond(request.header.call_id, b"ok").await;
            bind
        });

        let config = ChannelConfig::for_pipe(pipe_info);
        let mut channel = bind(pipe, &config, None).await.unwrap();
        assert_eq!(channel.secondary_addr(), pipe_info.server_pipe);
        assert!(channel.negotiated_flags().is_none());
        assert_eq!(&channel.call(0, b"hi").await.unwrap()[..], b"ok");

        let bind_pdu = server_task.await.unwrap();
        assert_eq!(
            bind_pdu.context_list[0].abstract_syntax,
            pipe_info.abstract_syntax,
            "{}",
            pipe_info.name
        );
        assert!(bind_pdu.auth_verifier.is_none());
    }
}

#[tokio::test]
async fn test_secondary_address_case_is_ignored() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let server_task = tokio::spawn(async move {
        server.accept_bind("\\pipe\\LSASS").await;
    });

    let config = ChannelConfig::for_pipe(&pipes::SAMR);
    let channel = bind(pipe, &config, None).await.unwrap();
    assert_eq!(channel.secondary_addr(), "\\pipe\\LSASS");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_smaller_server_fragments_win() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let server_task = tokio::spawn(async move {
        let bind = server.read_bind().await;
        let mut ack = BindAckPdu::new(
            bind.header.call_id,
            pipes::SRVSVC.server_pipe,
            bind.context_list[0].transfer_syntaxes[0],
        );
        ack.max_xmit_frag = 2048;
        ack.max_recv_frag = 1024;
        server.send(&ack.encode()).await;
    });

    let config = ChannelConfig::for_pipe(&pipes::SRVSVC);
    let channel = bind(pipe, &config, None).await.unwrap();
    assert_eq!(channel.max_xmit_frag(), 1024);
    assert_eq!(channel.max_recv_frag(), 2048);
    assert!(channel.max_recv_frag() < DEFAULT_MAX_FRAG);
    server_task.await.unwrap();
}

// ============================================================================
// Rejected binds
// ============================================================================

#[tokio::test]
async fn test_bind_nak() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let server_task = tokio::spawn(async move {
        server.reject_bind(4).await;
    });

    let config = ChannelConfig::for_pipe(&pipes::SAMR);
    let err = bind(pipe, &config, None).await.unwrap_err();
    assert!(matches!(err, BindError::Nak { reason: 4 }));
    assert!(!err.is_authentication_failure());
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_wrong_secondary_address() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let server_task = tokio::spawn(async move {
        server.accept_bind("\\PIPE\\spoolss").await;
    });

    let config = ChannelConfig::for_pipe(&pipes::LSARPC);
    match bind(pipe, &config, None).await {
        Err(BindError::SecondaryAddressMismatch { expected, got }) => {
            assert_eq!(expected, "\\PIPE\\lsass");
            assert_eq!(got, "\\PIPE\\spoolss");
        }
        other => panic!("expected secondary address mismatch, got {:?}", other.err()),
    }
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_ack_without_challenge() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let server_task = tokio::spawn(async move {
        // answers the NTLMSSP bind as if it were unauthenticated
        server.accept_bind(pipes::SAMR.server_pipe).await
    });

    let credentials = TestCredentials::new();
    let config = ChannelConfig::for_pipe(&pipes::SAMR);
    let err = bind(pipe, &config, Some(&credentials)).await.unwrap_err();
    assert!(matches!(err, BindError::MissingChallenge));
    assert!(err.is_authentication_failure());
    assert!(credentials.seen_challenge().is_none());

    let bind_pdu = server_task.await.unwrap();
    assert!(bind_pdu.auth_verifier.is_some());
}

#[tokio::test]
async fn test_garbage_challenge() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let server_task = tokio::spawn(async move {
        let bind = server.read_bind().await;
        let mut ack = BindAckPdu::new(
            bind.header.call_id,
            pipes::SAMR.server_pipe,
            bind.context_list[0].transfer_syntaxes[0],
        );
        ack.auth_verifier = Some(AuthVerifier::new(
            AuthType::Ntlm,
            AuthLevel::PktPrivacy,
            1,
            Bytes::from_static(b"NTLMSSP\0garbage"),
        ));
        server.send(&ack.encode()).await;
    });

    let credentials = TestCredentials::new();
    let config = ChannelConfig::for_pipe(&pipes::SAMR);
    let err = bind(pipe, &config, Some(&credentials)).await.unwrap_err();
    assert!(matches!(err, BindError::MalformedChallenge(_)));
    assert!(err.is_authentication_failure());
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_pipe_closed_during_bind() {
    init_logging();
    let (pipe, mut server) = pipe_pair();
    let server_task = tokio::spawn(async move {
        match server.read_pdu().await {
            Pdu::Bind(_) => {}
            other => panic!("expected bind, got {:?}", other),
        }
        // dropping the server closes the pipe
    });

    let config = ChannelConfig::for_pipe(&pipes::WKSSVC);
    let err = bind(pipe, &config, None).await.unwrap_err();
    assert!(matches!(err, BindError::Io(_)));
    server_task.await.unwrap();
}
