//! Socket side of a backend pipeline
//!
//! The pipeline itself never touches a socket: it writes through a
//! [`Transport`] and is fed by whoever reads the origin connection. For TCP
//! that is a dedicated reader thread per connection.

use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::pipeline::BackendPipeline;
use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Byte sink toward the origin
pub trait Transport: Send + Sync {
    /// Write all of `data`
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Close the connection; must be idempotent
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// [`Transport`] over a connected TCP stream
#[derive(Debug)]
pub struct TcpTransport {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        TcpTransport {
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
        }
    }

    /// Second handle on the same socket for the reader side
    pub fn reader(&self) -> io::Result<TcpStream> {
        self.stream.lock().try_clone()
    }
}

impl Transport for TcpTransport {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        let mut stream = self.stream.lock();
        stream.write_all(data)?;
        stream.flush()
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // Also unblocks the reader thread
            let _ = self.stream.lock().shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Open a TCP connection honouring the configured timeout and socket options
pub fn connect_tcp(
    addr: SocketAddr,
    timeout: Duration,
    nodelay: bool,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_nodelay(nodelay)?;
    socket.set_keepalive(true)?;
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {}:{}", host, port),
        )
    })
}

/// Connect to the connection's origin and start its backend pipeline.
///
/// The returned pipeline is active: negotiation has started and a reader
/// thread feeds it until the origin goes away.
pub fn connect_backend(connection: Arc<ConnectionContext>) -> Result<Arc<BackendPipeline>> {
    let server = connection.server_addr().clone();
    let config = connection.config().clone();
    let addr = resolve(&server.host, server.port)?;
    let stream = connect_tcp(addr, config.connect_timeout(), config.nodelay())?;
    debug!(connection = %connection.id(), %addr, "connected to origin");

    let transport = Arc::new(TcpTransport::new(stream));
    let reader = transport.reader()?;
    let id = connection.id();
    let pipeline = BackendPipeline::new(connection, transport);
    pipeline.activate();

    let reader_pipeline = pipeline.clone();
    let buffer_size = config.read_buffer_size();
    thread::Builder::new()
        .name(format!("backend-{}", id))
        .spawn(move || run_read_loop(reader, reader_pipeline, buffer_size))
        .map_err(Error::Transport)?;

    Ok(pipeline)
}

/// Feed everything read from `stream` into `pipeline` until EOF or error
pub fn run_read_loop<R: Read>(mut stream: R, pipeline: Arc<BackendPipeline>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                trace!(connection = %pipeline.connection().id(), "origin EOF");
                break;
            }
            Ok(n) => pipeline.on_read(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !pipeline.is_closed() {
                    warn!(connection = %pipeline.connection().id(), error = %e, "origin read failed");
                    pipeline.on_error(Error::Transport(e));
                }
                break;
            }
        }
        if pipeline.is_closed() {
            break;
        }
    }
    pipeline.on_inactive();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_transport_writes_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let stream = connect_tcp(addr, Duration::from_secs(1), true).unwrap();
        assert!(stream.nodelay().unwrap());
        let transport = TcpTransport::new(stream);
        transport.write(b"hello ").unwrap();
        transport.write(b"origin").unwrap();
        transport.close();
        transport.close();
        assert!(!transport.is_open());
        assert!(transport.write(b"late").is_err());

        assert_eq!(handle.join().unwrap(), b"hello origin");
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(connect_tcp(addr, Duration::from_millis(500), true).is_err());
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addr.port(), 8080);
    }
}
