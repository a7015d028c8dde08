//! TLS client configuration
//!
//! Builder for the OpenSSL context used on backend connections. Options are
//! collected first and applied in [`ClientConfigBuilder::build`], so a bad
//! cipher string or unreadable file surfaces as an error instead of a panic.

use openssl::pkey::PKey;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Case-insensitive, with or without the `v`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("TLS operation failed: {0}")]
    OperationFailed(String),
}

/// Client TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    ctx: SslContext,
    servername: Option<String>,
    verify_peer: bool,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub(crate) fn context(&self) -> &SslContext {
        &self.ctx
    }

    /// SNI override; defaults to the origin host
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("servername", &self.servername)
            .field("verify_peer", &self.verify_peer)
            .finish()
    }
}

/// Client configuration builder
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    min_version: TlsVersion,
    max_version: TlsVersion,
    cipher_list: Option<String>,
    ciphersuites: Option<String>,
    servername: Option<String>,
    verify_peer: bool,
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
}

impl Default for ClientConfigBuilder {
    /// TLS 1.2-1.3, no peer verification
    fn default() -> Self {
        ClientConfigBuilder {
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            cipher_list: None,
            ciphersuites: None,
            servername: None,
            verify_peer: false,
            ca_file: None,
            cert_file: None,
        }
    }
}

impl ClientConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = min;
        self.max_version = max;
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.cipher_list = Some(ciphers.into());
        self
    }

    /// Set cipher suites (for TLS 1.3)
    pub fn ciphersuites(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphersuites = Some(ciphers.into());
        self
    }

    /// Override the SNI name sent to the origin
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate and hostname verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Trust anchors for peer verification
    pub fn ca_file(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Client certificate and private key, both PEM in one file
    pub fn cert_file(mut self, path: impl AsRef<Path>) -> Self {
        self.cert_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        if self.min_version > self.max_version {
            return Err(TlsError::InvalidConfig(format!(
                "minimum version {} above maximum {}",
                self.min_version.as_str(),
                self.max_version.as_str()
            )));
        }

        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx.set_min_proto_version(Some(self.min_version.to_openssl_version()))?;
        ctx.set_max_proto_version(Some(self.max_version.to_openssl_version()))?;

        if let Some(ciphers) = &self.cipher_list {
            ctx.set_cipher_list(ciphers)?;
        }
        if let Some(suites) = &self.ciphersuites {
            ctx.set_ciphersuites(suites)?;
        }

        if self.verify_peer {
            ctx.set_verify(SslVerifyMode::PEER);
            match &self.ca_file {
                Some(path) => ctx.set_ca_file(path)?,
                None => ctx.set_default_verify_paths()?,
            }
        } else {
            ctx.set_verify(SslVerifyMode::NONE);
        }

        if let Some(path) = &self.cert_file {
            load_cert_and_key(&mut ctx, path)?;
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            servername: self.servername,
            verify_peer: self.verify_peer,
        })
    }
}

fn load_cert_and_key(ctx: &mut SslContextBuilder, path: &Path) -> Result<(), TlsError> {
    let pem = fs::read(path)?;

    let cert = X509::from_pem(&pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
    ctx.set_certificate(&cert)?;

    let key = PKey::private_key_from_pem(&pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
    ctx.set_private_key(&key)?;
    ctx.check_private_key()?;
    Ok(())
}

/// Encode protocols in ALPN wire format (length-prefixed)
pub fn encode_alpn<S: AsRef<str>>(protocols: &[S]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for proto in protocols {
        let proto = proto.as_ref();
        if proto.is_empty() || proto.len() > 255 {
            return Err(TlsError::InvalidConfig(format!(
                "ALPN protocol id {:?} must be 1-255 bytes",
                proto
            )));
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}
