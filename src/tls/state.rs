//! Per-connection TLS negotiation state
//!
//! Everything the negotiator needs to know about a connection's TLS and
//! ALPN situation, expressed as promises so the client-facing side can
//! settle them whenever it learns the answer.

use crate::error::Error;
use crate::promise::Promise;
use std::sync::atomic::{AtomicBool, Ordering};

/// TLS/ALPN state for one client↔origin connection pair
#[derive(Debug)]
pub struct TlsNegotiationState {
    enabled: bool,
    protocols: Promise<Vec<String>>,
    protocol: Promise<String>,
    negotiated: AtomicBool,
}

impl TlsNegotiationState {
    pub fn new(enabled: bool) -> Self {
        TlsNegotiationState {
            enabled,
            protocols: Promise::new(),
            protocol: Promise::new(),
            negotiated: AtomicBool::new(false),
        }
    }

    /// Whether the backend leg speaks TLS
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// ALPN-eligible protocols, settled by the client side
    pub fn protocols_promise(&self) -> &Promise<Vec<String>> {
        &self.protocols
    }

    /// Chosen protocol, settled by ALPN or forced beforehand
    pub fn protocol_promise(&self) -> &Promise<String> {
        &self.protocol
    }

    /// Resolved protocol list, empty while unresolved or failed
    pub fn protocols(&self) -> Vec<String> {
        self.protocols.get().unwrap_or_default()
    }

    /// Resolved protocol, if any
    pub fn protocol(&self) -> Option<String> {
        self.protocol.get()
    }

    /// True once `protocol` was settled by an actual ALPN exchange
    pub fn is_negotiated(&self) -> bool {
        self.negotiated.load(Ordering::Acquire)
    }

    /// Settle the protocol list
    pub fn set_protocols(&self, protocols: Vec<String>) -> bool {
        self.protocols.try_success(protocols)
    }

    /// Settle a pre-known protocol; `negotiated` stays false
    pub fn force_protocol(&self, protocol: impl Into<String>) -> bool {
        self.protocol.try_success(protocol.into())
    }

    /// Settle the protocol from an ALPN exchange.
    ///
    /// `negotiated` is raised before any continuation of `protocol` runs,
    /// and only if this call won the resolution.
    pub fn complete_alpn(&self, protocol: impl Into<String>) -> bool {
        self.protocol.try_complete_with(Ok(protocol.into()), || {
            self.negotiated.store(true, Ordering::Release)
        })
    }

    /// Fail the protocol if still unsettled
    pub fn fail(&self, cause: Error) -> bool {
        self.protocol.try_failure(cause)
    }
}
