//! Channel configuration

use crate::dcerpc::{SyntaxId, Uuid};
use crate::dcerpc_transport::DEFAULT_MAX_PDU_SIZE;
use crate::ntlmssp::Flags;
use crate::pipes::WellKnownPipe;
use crate::security::AuthLevel;

/// Fragment size offered in the bind unless configured otherwise
pub const DEFAULT_MAX_FRAG: u16 = 0x1630;

/// Everything `bind` needs besides the transport and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Interface to bind to
    pub abstract_syntax: SyntaxId,
    pub transfer_syntax: SyntaxId,
    /// Secondary address the server must report, compared ignoring case.
    /// `None` accepts any address.
    pub expected_secondary_address: Option<String>,
    pub context_id: u16,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    /// Largest fragment accepted from the pipe
    pub max_pdu_size: usize,
    /// Flags requested in the NTLMSSP NEGOTIATE message
    pub ntlmssp_flags: Flags,
    /// Sent in every auth trailer; signing and sealing follow the
    /// negotiated flags, not this value
    pub auth_level: AuthLevel,
    pub auth_context_id: u32,
    pub workstation: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            abstract_syntax: SyntaxId::new(Uuid::NIL, 0, 0),
            transfer_syntax: SyntaxId::NDR,
            expected_secondary_address: None,
            context_id: 0,
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            ntlmssp_flags: Flags::client_default(),
            auth_level: AuthLevel::PktPrivacy,
            auth_context_id: 1,
            workstation: String::new(),
        }
    }
}

impl ChannelConfig {
    /// Defaults for a well-known pipe, with its server pipe as the expected
    /// secondary address.
    pub fn for_pipe(pipe: &WellKnownPipe) -> Self {
        ChannelConfigBuilder::for_pipe(pipe).build()
    }

    pub fn builder(abstract_syntax: SyntaxId) -> ChannelConfigBuilder {
        ChannelConfigBuilder::from_syntax(abstract_syntax)
    }
}

/// Builder for [`ChannelConfig`]
#[derive(Debug, Clone)]
pub struct ChannelConfigBuilder {
    config: ChannelConfig,
}

impl ChannelConfigBuilder {
    pub fn new(interface_uuid: Uuid, major_version: u16, minor_version: u16) -> Self {
        Self::from_syntax(SyntaxId::new(interface_uuid, major_version, minor_version))
    }

    pub fn from_syntax(abstract_syntax: SyntaxId) -> Self {
        Self {
            config: ChannelConfig {
                abstract_syntax,
                ..ChannelConfig::default()
            },
        }
    }

    pub fn for_pipe(pipe: &WellKnownPipe) -> Self {
        Self::from_syntax(pipe.abstract_syntax)
            .transfer_syntax(pipe.transfer_syntax)
            .expected_secondary_address(pipe.server_pipe)
    }

    pub fn transfer_syntax(mut self, syntax: SyntaxId) -> Self {
        self.config.transfer_syntax = syntax;
        self
    }

    pub fn expected_secondary_address(mut self, address: impl Into<String>) -> Self {
        self.config.expected_secondary_address = Some(address.into());
        self
    }

    /// Accept whatever secondary address the server reports
    pub fn any_secondary_address(mut self) -> Self {
        self.config.expected_secondary_address = None;
        self
    }

    pub fn context_id(mut self, context_id: u16) -> Self {
        self.config.context_id = context_id;
        self
    }

    pub fn max_frag(mut self, max_xmit_frag: u16, max_recv_frag: u16) -> Self {
        self.config.max_xmit_frag = max_xmit_frag;
        self.config.max_recv_frag = max_recv_frag;
        self
    }

    pub fn max_pdu_size(mut self, size: usize) -> Self {
        self.config.max_pdu_size = size;
        self
    }

    pub fn ntlmssp_flags(mut self, flags: Flags) -> Self {
        self.config.ntlmssp_flags = flags;
        self
    }

    pub fn auth_level(mut self, level: AuthLevel) -> Self {
        self.config.auth_level = level;
        self
    }

    pub fn auth_context_id(mut self, id: u32) -> Self {
        self.config.auth_context_id = id;
        self
    }

    pub fn workstation(mut self, name: impl Into<String>) -> Self {
        self.config.workstation = name.into();
        self
    }

    pub fn build(self) -> ChannelConfig {
        self.config
    }
}
