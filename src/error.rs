//! Crate-level error type
//!
//! Every failure is scoped to one client↔origin connection pair: the
//! pipeline that hits an error closes both legs and nothing is retried.

use crate::h2;
use crate::tls::TlsError;
use std::io;
use std::sync::Arc;

/// Errors raised while negotiating or bridging a backend connection
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Protocol selection could not complete
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// No handler is registered for the selected protocol
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Origin used a stream id that was never allocated on this connection
    #[error("No stream found: {0}")]
    StreamConsistency(u32),

    /// Socket level failure
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// HTTP/2 framing, HPACK or flow control failure
    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    /// The connection went away before the operation could finish
    #[error("Channel was closed")]
    ChannelClosed,

    /// A handler received a message kind it cannot carry
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// A promise this operation depended on failed
    #[error("{0}")]
    PromiseFailed(#[source] Arc<Error>),
}

impl Error {
    /// True for errors caused by the connection going away
    pub fn is_closed(&self) -> bool {
        match self {
            Error::ChannelClosed => true,
            Error::PromiseFailed(cause) => cause.is_closed(),
            _ => false,
        }
    }
}

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
