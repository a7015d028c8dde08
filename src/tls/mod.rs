//! TLS on the backend leg
//!
//! - [`TlsConfig`] builds the OpenSSL client context (versions, ciphers,
//!   verification, client certificate).
//! - [`TlsSession`] runs one client handshake over in-memory buffers and then
//!   encrypts and decrypts application data.
//! - [`TlsNegotiationState`] carries the ALPN protocol list and the chosen
//!   protocol for a connection pair.

pub mod config;
pub mod session;
pub mod state;

pub use config::{encode_alpn, ClientConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use session::{TlsProgress, TlsSession};
pub use state::TlsNegotiationState;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
