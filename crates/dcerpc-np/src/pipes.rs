//! Well-known named pipes and the interfaces served behind them
//!
//! The server answers a bind on a client-facing pipe with the name of the
//! pipe it actually listens on (the BIND_ACK secondary address), so
//! `\PIPE\samr` reports `\PIPE\lsass`.

use crate::dcerpc::{SyntaxId, Uuid};

/// A named pipe, its interface and the server pipe that answers for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnownPipe {
    /// Client-side pipe name, e.g. `\PIPE\samr`
    pub name: &'static str,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntax: SyntaxId,
    /// Secondary address expected in the bind ack
    pub server_pipe: &'static str,
}

impl WellKnownPipe {
    const fn ndr(
        name: &'static str,
        abstract_syntax: SyntaxId,
        server_pipe: &'static str,
    ) -> Self {
        Self {
            name,
            abstract_syntax,
            transfer_syntax: SyntaxId::NDR,
            server_pipe,
        }
    }

    /// Name without the `\PIPE\` prefix
    pub fn short_name(&self) -> &'static str {
        strip_pipe_prefix(self.name)
    }
}

pub const LSARPC: WellKnownPipe = WellKnownPipe::ndr(
    "\\PIPE\\lsarpc",
    SyntaxId::new(
        Uuid::new(0x1234_5778, 0x1234, 0xabcd, 0xef00, [0x01, 0x23, 0x45, 0x67, 0x89, 0xab]),
        0,
        0,
    ),
    "\\PIPE\\lsass",
);

pub const SAMR: WellKnownPipe = WellKnownPipe::ndr(
    "\\PIPE\\samr",
    SyntaxId::new(
        Uuid::new(0x1234_5778, 0x1234, 0xabcd, 0xef00, [0x01, 0x23, 0x45, 0x67, 0x89, 0xac]),
        1,
        0,
    ),
    "\\PIPE\\lsass",
);

pub const NETLOGON: WellKnownPipe = WellKnownPipe::ndr(
    "\\PIPE\\NETLOGON",
    SyntaxId::new(
        Uuid::new(0x1234_5678, 0x1234, 0xabcd, 0xef00, [0x01, 0x23, 0x45, 0x67, 0xcf, 0xfb]),
        1,
        0,
    ),
    "\\PIPE\\lsass",
);

pub const SRVSVC: WellKnownPipe = WellKnownPipe::ndr(
    "\\PIPE\\srvsvc",
    SyntaxId::new(
        Uuid::new(0x4b32_4fc8, 0x1670, 0x01d3, 0x1278, [0x5a, 0x47, 0xbf, 0x6e, 0xe1, 0x88]),
        3,
        0,
    ),
    "\\PIPE\\ntsvcs",
);

pub const WKSSVC: WellKnownPipe = WellKnownPipe::ndr(
    "\\PIPE\\wkssvc",
    SyntaxId::new(
        Uuid::new(0x6bff_d098, 0xa112, 0x3610, 0x9833, [0x46, 0xc3, 0xf8, 0x7e, 0x34, 0x5a]),
        1,
        0,
    ),
    "\\PIPE\\ntsvcs",
);

pub const WINREG: WellKnownPipe = WellKnownPipe::ndr(
    "\\PIPE\\winreg",
    SyntaxId::new(
        Uuid::new(0x338c_d001, 0x2244, 0x31f1, 0xaaaa, [0x90, 0x00, 0x38, 0x00, 0x10, 0x03]),
        1,
        0,
    ),
    "\\PIPE\\winreg",
);

pub const WELL_KNOWN_PIPES: &[WellKnownPipe] = &[LSARPC, SAMR, NETLOGON, SRVSVC, WKSSVC, WINREG];

fn strip_pipe_prefix(name: &str) -> &str {
    match name.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("\\PIPE\\") => &name[6..],
        _ => name,
    }
}

/// Find a pipe by name, ignoring case. The `\PIPE\` prefix is optional.
pub fn lookup(name: &str) -> Option<&'static WellKnownPipe> {
    let wanted = strip_pipe_prefix(name);
    WELL_KNOWN_PIPES
        .iter()
        .find(|pipe| pipe.short_name().eq_ignore_ascii_case(wanted))
}
