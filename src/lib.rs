//! backend-bridge - backend leg of an intercepting reverse proxy
//!
//! For every client connection a proxy accepts, it opens a connection to the
//! origin and hands it to a [`BackendPipeline`]. The pipeline decides which
//! application protocol runs toward the origin (TLS + ALPN, or a protocol
//! known up front), installs the matching [`ProtocolHandler`] without losing
//! anything the client side wrote in the meantime, and for HTTP/2 renumbers
//! streams so the client side keeps its own stream ids.
//!
//! The core is event driven and performs no I/O of its own: bytes leave
//! through a [`Transport`] and are fed back in with
//! [`BackendPipeline::on_read`]. [`connect_backend`] wires a pipeline to a
//! real TCP socket.
//!
//! # Example
//!
//! ```no_run
//! use backend_bridge::testing::RecordingClientLeg;
//! use backend_bridge::{
//!     connect_backend, BackendConfig, ConnectionContext, Message, ProtocolRegistry, ServerAddr,
//! };
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! let config = Arc::new(BackendConfig::builder().build().unwrap());
//! let client = Arc::new(RecordingClientLeg::new());
//! let connection = Arc::new(ConnectionContext::new(
//!     client,
//!     ServerAddr::new("origin.example", 80),
//!     false,
//!     Arc::new(ProtocolRegistry::with_defaults()),
//!     config,
//! ));
//! connection.tls().set_protocols(vec!["http/1.1".into()]);
//! connection.tls().force_protocol("http/1.1");
//!
//! let pipeline = connect_backend(connection).unwrap();
//! pipeline.write(Message::Bytes(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")));
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod forward;
pub mod h2;
pub mod handler;
pub mod logging;
pub mod message;
pub mod negotiator;
pub mod pipeline;
pub mod promise;
pub mod protocol;
pub mod provider;
pub mod testing;
pub mod tls;
pub mod transport;

pub use config::{BackendConfig, BackendConfigBuilder};
pub use context::{ClientLeg, ConnectionContext, ConnectionId, ServerAddr};
pub use error::{Error, Result};
pub use forward::ForwardHandler;
pub use handler::{HandlerContext, ProtocolHandler};
pub use message::Message;
pub use negotiator::{fallback_protocol, AlpnCompletion, BackendProtocolNegotiator};
pub use pipeline::BackendPipeline;
pub use promise::{Outcome, Promise};
pub use protocol::{Protocol, ALPN_HTTP_1_1, ALPN_HTTP_2};
pub use provider::{ProtocolHandlerProvider, ProtocolRegistry};
pub use transport::{connect_backend, TcpTransport, Transport};
