//! Shared state of one client↔origin connection pair

use crate::config::BackendConfig;
use crate::message::Message;
use crate::provider::ProtocolHandlerProvider;
use crate::tls::TlsNegotiationState;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Only uniqueness matters, so relaxed ordering is enough
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier used for log correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle to the client-facing side of the connection pair
pub trait ClientLeg: Send + Sync {
    /// Deliver a message to the client side
    fn write(&self, message: Message);

    /// Close the client connection; must be idempotent
    fn close(&self);
}

/// Origin address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddr {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Long-lived state shared by the negotiator and whichever protocol handler
/// it installs
pub struct ConnectionContext {
    id: ConnectionId,
    client: Arc<dyn ClientLeg>,
    server: ServerAddr,
    tls: TlsNegotiationState,
    provider: Arc<dyn ProtocolHandlerProvider>,
    config: Arc<BackendConfig>,
}

impl ConnectionContext {
    pub fn new(
        client: Arc<dyn ClientLeg>,
        server: ServerAddr,
        tls_enabled: bool,
        provider: Arc<dyn ProtocolHandlerProvider>,
        config: Arc<BackendConfig>,
    ) -> Self {
        ConnectionContext {
            id: ConnectionId::new(),
            client,
            server,
            tls: TlsNegotiationState::new(tls_enabled),
            provider,
            config,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client(&self) -> &Arc<dyn ClientLeg> {
        &self.client
    }

    pub fn server_addr(&self) -> &ServerAddr {
        &self.server
    }

    pub fn tls(&self) -> &TlsNegotiationState {
        &self.tls
    }

    pub fn provider(&self) -> &Arc<dyn ProtocolHandlerProvider> {
        &self.provider
    }

    pub fn config(&self) -> &Arc<BackendConfig> {
        &self.config
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.id, self.server)
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("tls", &self.tls)
            .finish()
    }
}
