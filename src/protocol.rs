//! Application protocols a backend connection can run
//!
//! Two vocabularies meet here: the proxy's own protocol names (`http/1`,
//! `http/2`, `forward`) and the ALPN identifiers exchanged in the TLS
//! handshake (`http/1.1`, `h2`).

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// ALPN identifier for HTTP/1.1
pub const ALPN_HTTP_1_1: &str = "http/1.1";
/// ALPN identifier for HTTP/2 over TLS
pub const ALPN_HTTP_2: &str = "h2";

/// Protocol spoken on the backend leg once negotiation settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
    /// Opaque byte forwarding
    Forward,
}

impl Protocol {
    /// Proxy-internal protocol name
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1",
            Protocol::Http2 => "http/2",
            Protocol::Forward => "forward",
        }
    }

    /// Map an ALPN selection to a protocol; anything unrecognised is forwarded
    pub fn from_alpn(alpn: &str) -> Protocol {
        match alpn {
            ALPN_HTTP_1_1 => Protocol::Http1,
            ALPN_HTTP_2 => Protocol::Http2,
            _ => Protocol::Forward,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    /// Accepts both protocol names and ALPN identifiers
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http/1" | ALPN_HTTP_1_1 => Ok(Protocol::Http1),
            "http/2" | ALPN_HTTP_2 => Ok(Protocol::Http2),
            "forward" => Ok(Protocol::Forward),
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }
}
