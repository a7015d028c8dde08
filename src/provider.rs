//! Protocol → handler dispatch

use crate::error::{Error, Result};
use crate::forward::ForwardHandler;
use crate::h2::Http2StreamTranslator;
use crate::handler::ProtocolHandler;
use crate::protocol::Protocol;
use std::collections::HashMap;
use std::sync::Arc;

/// Supplies the handler that replaces the negotiator for a protocol
pub trait ProtocolHandlerProvider: Send + Sync {
    /// Fails with [`Error::UnsupportedProtocol`] when nothing can serve it
    fn handler_for(&self, protocol: Protocol) -> Result<Arc<dyn ProtocolHandler>>;
}

type Factory = Arc<dyn Fn() -> Arc<dyn ProtocolHandler> + Send + Sync>;

/// Dispatch table from protocol to handler factory
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    factories: HashMap<Protocol, Factory>,
}

impl ProtocolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        ProtocolRegistry::default()
    }

    /// HTTP/2 → stream translator, HTTP/1 and forward → byte pass-through
    pub fn with_defaults() -> Self {
        ProtocolRegistry::new()
            .register(Protocol::Http2, || {
                Arc::new(Http2StreamTranslator::new()) as Arc<dyn ProtocolHandler>
            })
            .register(Protocol::Http1, || {
                Arc::new(ForwardHandler::new(Protocol::Http1)) as Arc<dyn ProtocolHandler>
            })
            .register(Protocol::Forward, || {
                Arc::new(ForwardHandler::new(Protocol::Forward)) as Arc<dyn ProtocolHandler>
            })
    }

    /// Register (or replace) the factory for `protocol`
    pub fn register<F>(mut self, protocol: Protocol, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn ProtocolHandler> + Send + Sync + 'static,
    {
        self.factories.insert(protocol, Arc::new(factory));
        self
    }

    pub fn unregister(mut self, protocol: Protocol) -> Self {
        self.factories.remove(&protocol);
        self
    }

    pub fn supports(&self, protocol: Protocol) -> bool {
        self.factories.contains_key(&protocol)
    }
}

impl ProtocolHandlerProvider for ProtocolRegistry {
    fn handler_for(&self, protocol: Protocol) -> Result<Arc<dyn ProtocolHandler>> {
        self.factories
            .get(&protocol)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnsupportedProtocol(protocol.to_string()))
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut protocols: Vec<_> = self.factories.keys().map(Protocol::as_str).collect();
        protocols.sort_unstable();
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &protocols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_protocol() {
        let registry = ProtocolRegistry::with_defaults();
        for protocol in [Protocol::Http1, Protocol::Http2, Protocol::Forward] {
            assert!(registry.supports(protocol));
            assert_eq!(registry.handler_for(protocol).unwrap().protocol(), protocol);
        }
    }

    #[test]
    fn test_unregistered_protocol_is_unsupported() {
        let registry = ProtocolRegistry::with_defaults().unregister(Protocol::Http2);
        assert!(!registry.supports(Protocol::Http2));
        assert!(matches!(
            registry.handler_for(Protocol::Http2),
            Err(Error::UnsupportedProtocol(p)) if p == "http/2"
        ));
    }

    #[test]
    fn test_each_lookup_builds_a_fresh_handler() {
        let registry = ProtocolRegistry::with_defaults();
        let a = registry.handler_for(Protocol::Http2).unwrap();
        let b = registry.handler_for(Protocol::Http2).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_debug_lists_protocols() {
        let registry = ProtocolRegistry::new().register(Protocol::Forward, || {
            Arc::new(ForwardHandler::new(Protocol::Forward)) as Arc<dyn ProtocolHandler>
        });
        assert_eq!(
            format!("{:?}", registry),
            r#"ProtocolRegistry { protocols: ["forward"] }"#
        );
    }
}
