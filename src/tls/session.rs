//! Sans-IO TLS client session
//!
//! OpenSSL is driven over an in-memory transport: ciphertext from the origin
//! is pushed in with [`TlsSession::read_tls`], and every call hands back the
//! ciphertext OpenSSL wants sent. The pipeline owning the session decides
//! when those bytes actually reach the socket.

use super::config::{encode_alpn, TlsConfig, TlsError};
use bytes::{Buf, Bytes, BytesMut};
use openssl::ssl::{ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslStream};
use std::io::{self, Read, Write};
use std::net::IpAddr;
use tracing::trace;

const READ_CHUNK: usize = 16 * 1024;

/// In-memory transport under the SSL stream
#[derive(Debug, Default)]
struct MemoryIo {
    incoming: BytesMut,
    outgoing: BytesMut,
}

impl Read for MemoryIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.incoming.len());
        buf[..n].copy_from_slice(&self.incoming[..n]);
        self.incoming.advance(n);
        Ok(n)
    }
}

impl Write for MemoryIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemoryIo {
    fn take_outgoing(&mut self) -> Option<Bytes> {
        if self.outgoing.is_empty() {
            None
        } else {
            Some(self.outgoing.split().freeze())
        }
    }
}

enum Stage {
    Handshaking(MidHandshakeSslStream<MemoryIo>),
    Established(SslStream<MemoryIo>),
    Closed,
}

/// What one batch of inbound ciphertext produced
#[derive(Debug, Default)]
pub struct TlsProgress {
    /// Ciphertext to send to the origin
    pub outbound: Option<Bytes>,
    /// Decrypted application data
    pub plaintext: Option<Bytes>,
    /// The handshake finished during this call
    pub handshake_completed: bool,
    /// The origin sent close_notify
    pub closed: bool,
}

/// Client side of a TLS connection to the origin
pub struct TlsSession {
    stage: Stage,
    selected_alpn: Option<String>,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self.stage {
            Stage::Handshaking(_) => "handshaking",
            Stage::Established(_) => "established",
            Stage::Closed => "closed",
        };
        f.debug_struct("TlsSession")
            .field("stage", &stage)
            .field("selected_alpn", &self.selected_alpn)
            .finish()
    }
}

impl TlsSession {
    /// Start a handshake with `host`, advertising `alpn` if non-empty.
    ///
    /// Returns the session and the ClientHello to send.
    pub fn connect(
        config: &TlsConfig,
        host: &str,
        alpn: &[String],
    ) -> Result<(TlsSession, Bytes), TlsError> {
        let mut ssl = Ssl::new(config.context())?;
        let name = config.servername().unwrap_or(host);

        match name.parse::<IpAddr>() {
            Ok(ip) => {
                if config.verify_peer() {
                    ssl.param_mut().set_ip(ip)?;
                }
            }
            Err(_) => {
                ssl.set_hostname(name)?;
                if config.verify_peer() {
                    ssl.param_mut().set_host(name)?;
                }
            }
        }

        if !alpn.is_empty() {
            ssl.set_alpn_protos(&encode_alpn(alpn)?)?;
        }

        let mut session = TlsSession {
            stage: Stage::Closed,
            selected_alpn: None,
        };
        let client_hello = match ssl.connect(MemoryIo::default()) {
            Err(HandshakeError::WouldBlock(mut mid)) => {
                let hello = mid.get_mut().take_outgoing();
                session.stage = Stage::Handshaking(mid);
                hello
            }
            Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),
            Err(HandshakeError::Failure(mid)) => {
                return Err(TlsError::HandshakeFailed(mid.error().to_string()))
            }
            Ok(_) => {
                return Err(TlsError::HandshakeFailed(
                    "handshake completed without a peer".into(),
                ))
            }
        };

        trace!(host = name, alpn = ?alpn, "sending ClientHello");
        Ok((session, client_hello.unwrap_or_default()))
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self.stage, Stage::Handshaking(_))
    }

    pub fn is_established(&self) -> bool {
        matches!(self.stage, Stage::Established(_))
    }

    /// ALPN protocol the origin selected, once the handshake is done
    pub fn selected_alpn(&self) -> Option<&str> {
        self.selected_alpn.as_deref()
    }

    /// Feed ciphertext from the origin
    pub fn read_tls(&mut self, data: &[u8]) -> Result<TlsProgress, TlsError> {
        let mut progress = TlsProgress::default();

        match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Handshaking(mut mid) => {
                mid.get_mut().incoming.extend_from_slice(data);
                match mid.handshake() {
                    Ok(stream) => {
                        self.selected_alpn = stream
                            .ssl()
                            .selected_alpn_protocol()
                            .map(|p| String::from_utf8_lossy(p).into_owned());
                        progress.handshake_completed = true;
                        self.stage = Stage::Established(stream);
                    }
                    Err(HandshakeError::WouldBlock(mut mid)) => {
                        progress.outbound = mid.get_mut().take_outgoing();
                        self.stage = Stage::Handshaking(mid);
                        return Ok(progress);
                    }
                    Err(HandshakeError::Failure(mid)) => {
                        return Err(TlsError::HandshakeFailed(mid.error().to_string()))
                    }
                    Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),
                }
            }
            Stage::Established(mut stream) => {
                stream.get_mut().incoming.extend_from_slice(data);
                self.stage = Stage::Established(stream);
            }
            Stage::Closed => {
                return Err(TlsError::OperationFailed("session is closed".into()));
            }
        }

        if let Stage::Established(stream) = &mut self.stage {
            let (plaintext, closed) = drain_plaintext(stream)?;
            progress.plaintext = plaintext;
            progress.closed = closed;
            progress.outbound = stream.get_mut().take_outgoing();
        }
        if progress.closed {
            self.stage = Stage::Closed;
        }
        Ok(progress)
    }

    /// Encrypt application data for the origin
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Bytes, TlsError> {
        let stream = match &mut self.stage {
            Stage::Established(stream) => stream,
            _ => {
                return Err(TlsError::OperationFailed(
                    "write before handshake completed".into(),
                ))
            }
        };

        let mut rest = plaintext;
        while !rest.is_empty() {
            let n = stream
                .ssl_write(rest)
                .map_err(|e| TlsError::OperationFailed(e.to_string()))?;
            rest = &rest[n..];
        }
        Ok(stream.get_mut().take_outgoing().unwrap_or_default())
    }

    /// Send close_notify if the session is established; returns the alert
    pub fn shutdown(&mut self) -> Option<Bytes> {
        match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Established(mut stream) => {
                // The peer's close_notify is never awaited
                let _ = stream.shutdown();
                stream.get_mut().take_outgoing()
            }
            _ => None,
        }
    }
}

fn drain_plaintext(stream: &mut SslStream<MemoryIo>) -> Result<(Option<Bytes>, bool), TlsError> {
    let mut plaintext = BytesMut::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.ssl_read(&mut buf) {
            Ok(0) => return Ok((freeze(plaintext), true)),
            Ok(n) => plaintext.extend_from_slice(&buf[..n]),
            Err(e) if e.code() == ErrorCode::WANT_READ => return Ok((freeze(plaintext), false)),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => return Ok((freeze(plaintext), true)),
            Err(e) => return Err(TlsError::OperationFailed(e.to_string())),
        }
    }
}

fn freeze(buf: BytesMut) -> Option<Bytes> {
    if buf.is_empty() {
        None
    } else {
        Some(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_io_would_block_when_empty() {
        let mut io = MemoryIo::default();
        let mut buf = [0u8; 4];
        assert_eq!(
            io.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        io.incoming.extend_from_slice(b"abcdef");
        assert_eq!(io.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(io.incoming.len(), 2);

        io.write_all(b"out").unwrap();
        assert_eq!(io.take_outgoing(), Some(Bytes::from_static(b"out")));
        assert_eq!(io.take_outgoing(), None);
    }

    #[test]
    fn test_connect_produces_client_hello() {
        let config = TlsConfig::client().build().unwrap();
        let alpn = vec!["h2".to_string(), "http/1.1".to_string()];
        let (session, hello) = TlsSession::connect(&config, "origin.test", &alpn).unwrap();

        assert!(session.is_handshaking());
        assert!(session.selected_alpn().is_none());
        // TLS record header: handshake content type
        assert_eq!(hello[0], 0x16);
        let needle = b"\x02h2\x08http/1.1";
        assert!(hello.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_encrypt_before_handshake_fails() {
        let config = TlsConfig::client().build().unwrap();
        let (mut session, _) = TlsSession::connect(&config, "127.0.0.1", &[]).unwrap();
        assert!(matches!(
            session.encrypt(b"GET / HTTP/1.1\r\n\r\n"),
            Err(TlsError::OperationFailed(_))
        ));
        assert!(session.shutdown().is_none());
    }

    #[test]
    fn test_garbage_from_peer_fails_handshake() {
        let config = TlsConfig::client().build().unwrap();
        let (mut session, _) = TlsSession::connect(&config, "origin.test", &[]).unwrap();
        let result = session.read_tls(b"HTTP/1.1 400 Bad Request\r\n\r\n");
        assert!(matches!(result, Err(TlsError::HandshakeFailed(_))));
    }
}
