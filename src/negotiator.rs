//! Backend protocol negotiation
//!
//! The negotiator is the first stage of every backend pipeline. It waits for
//! the client side to settle the ALPN protocol list, drives TLS if the
//! origin needs it, and finally asks the pipeline to install the handler for
//! whichever protocol was chosen. Writes arriving from the client before
//! that point are queued and flushed, in order, into the new handler.

use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::handler::{HandlerContext, ProtocolHandler};
use crate::message::Message;
use crate::pipeline::BackendPipeline;
use crate::protocol::{Protocol, ALPN_HTTP_1_1};
use crate::tls::TlsNegotiationState;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Protocol to fall back to when the origin selects nothing over ALPN.
///
/// Prefers what the client side negotiated, then HTTP/1.1 if the client
/// offered it, then raw forwarding.
pub fn fallback_protocol(tls: &TlsNegotiationState) -> String {
    if tls.is_negotiated() {
        if let Some(protocol) = tls.protocol() {
            return protocol;
        }
    }
    if tls.protocols().iter().any(|p| p == ALPN_HTTP_1_1) {
        return ALPN_HTTP_1_1.to_string();
    }
    Protocol::Forward.as_str().to_string()
}

#[derive(Default)]
struct Pending {
    writes: VecDeque<Message>,
    inbound: Vec<Bytes>,
    installed: Option<Arc<dyn ProtocolHandler>>,
    released: bool,
}

/// Negotiation stage of a backend pipeline
#[derive(Default)]
pub struct BackendProtocolNegotiator {
    pending: Mutex<Pending>,
}

impl BackendProtocolNegotiator {
    pub fn new() -> Self {
        BackendProtocolNegotiator::default()
    }

    /// Subscribe to the connection's protocol list and take it from there.
    ///
    /// Listeners only keep a weak reference to the pipeline so an
    /// unresolved promise never keeps a dead connection alive.
    pub(crate) fn handler_added(&self, pipeline: &BackendPipeline) {
        let connection = pipeline.connection();
        let weak = pipeline.downgrade();

        connection
            .tls()
            .protocols_promise()
            .add_listener(move |outcome| {
                let pipeline = match weak.upgrade() {
                    Some(pipeline) => pipeline,
                    None => return,
                };
                match outcome {
                    Err(cause) => pipeline.on_error(Error::PromiseFailed(cause.clone())),
                    Ok(_) if pipeline.connection().tls().is_enabled() => {
                        let fallback = fallback_protocol(pipeline.connection().tls());
                        if let Err(e) = pipeline.configure_tls(fallback) {
                            pipeline.on_error(e);
                        }
                    }
                    Ok(_) => await_protocol(&pipeline),
                }
            });
    }

    /// Queue a client write; flushes straight through once a handler is in
    pub fn write(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.released {
            warn!(
                connection = %ctx.connection().id(),
                message = message.kind(),
                "write after backend closed, dropping"
            );
            return Ok(());
        }
        pending.writes.push_back(message);
        match pending.installed.clone() {
            Some(handler) => flush(&mut pending.writes, &handler, ctx),
            None => {
                trace!(
                    connection = %ctx.connection().id(),
                    queued = pending.writes.len(),
                    "write queued until protocol is settled"
                );
                Ok(())
            }
        }
    }

    /// Hold inbound plaintext that arrived before a handler was installed.
    ///
    /// Returns the data back with the handler if one got installed in the
    /// meantime.
    pub(crate) fn hold_inbound(
        &self,
        data: Bytes,
    ) -> Option<(Arc<dyn ProtocolHandler>, Bytes)> {
        let mut pending = self.pending.lock();
        match pending.installed.clone() {
            Some(handler) => Some((handler, data)),
            None => {
                if !pending.released {
                    pending.inbound.push(data);
                }
                None
            }
        }
    }

    /// Hand over to `handler`: queued writes are flushed into it in arrival
    /// order and the held inbound data is returned for replay
    pub(crate) fn detach(
        &self,
        ctx: &HandlerContext,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<Vec<Bytes>> {
        let mut pending = self.pending.lock();
        pending.installed = Some(handler.clone());
        let inbound = std::mem::take(&mut pending.inbound);
        let queued = pending.writes.len();
        flush(&mut pending.writes, &handler, ctx)?;
        debug!(
            connection = %ctx.connection().id(),
            protocol = %handler.protocol(),
            flushed = queued,
            "negotiator removed"
        );
        Ok(inbound)
    }

    /// The backend went away during negotiation
    pub(crate) fn inactive(&self, ctx: &HandlerContext) {
        ctx.connection().client().close();
        let mut pending = self.pending.lock();
        pending.released = true;
        let dropped = pending.writes.len() + pending.inbound.len();
        pending.writes.clear();
        pending.inbound.clear();
        if dropped > 0 {
            debug!(
                connection = %ctx.connection().id(),
                dropped,
                "released pending messages"
            );
        }
    }

    /// Failure while negotiating; the caller closes the pipeline afterwards
    pub(crate) fn exception_caught(&self, connection: &ConnectionContext, cause: &Error) {
        if cause.is_closed() {
            debug!(connection = %connection.id(), error = %cause, "closed during negotiation");
        } else {
            error!(connection = %connection.id(), error = %cause, "backend negotiation error");
        }
        let tls = connection.tls();
        if !tls.is_negotiated() {
            tls.fail(Error::Negotiation(cause.to_string()));
        }
    }
}

impl std::fmt::Debug for BackendProtocolNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("BackendProtocolNegotiator")
            .field("writes", &pending.writes.len())
            .field("inbound", &pending.inbound.len())
            .field("installed", &pending.installed.as_ref().map(|h| h.protocol()))
            .field("released", &pending.released)
            .finish()
    }
}

fn flush(
    writes: &mut VecDeque<Message>,
    handler: &Arc<dyn ProtocolHandler>,
    ctx: &HandlerContext,
) -> Result<()> {
    while let Some(message) = writes.pop_front() {
        if let Err(e) = handler.write(ctx, message) {
            writes.clear();
            return Err(e);
        }
    }
    Ok(())
}

/// Non-TLS path: wait for the protocol itself to be settled
fn await_protocol(pipeline: &Arc<BackendPipeline>) {
    let weak: Weak<BackendPipeline> = Arc::downgrade(pipeline);
    pipeline
        .connection()
        .tls()
        .protocol_promise()
        .add_listener(move |outcome| {
            let pipeline = match weak.upgrade() {
                Some(pipeline) => pipeline,
                None => return,
            };
            match outcome {
                Ok(name) => configure_protocol(&pipeline, name),
                Err(cause) => pipeline.on_error(Error::PromiseFailed(cause.clone())),
            }
        });
}

/// Install the handler for a protocol name, closing on unknown names
pub(crate) fn configure_protocol(pipeline: &BackendPipeline, name: &str) {
    match name.parse::<Protocol>() {
        Ok(protocol) => pipeline.install(protocol),
        Err(e) => {
            error!(
                connection = %pipeline.connection().id(),
                protocol = name,
                error = %e,
                "Unsupported protocol"
            );
            pipeline.close();
        }
    }
}

/// Finishes negotiation once the TLS handshake with the origin is done
#[derive(Debug)]
pub struct AlpnCompletion {
    fallback: String,
}

impl AlpnCompletion {
    pub fn new(fallback: impl Into<String>) -> Self {
        AlpnCompletion {
            fallback: fallback.into(),
        }
    }

    /// Handshake done; `selected` is what the origin picked, if anything.
    ///
    /// The protocol promise is only settled if nobody negotiated it yet,
    /// but the handler always follows what this handshake selected.
    pub(crate) fn complete(self, pipeline: &BackendPipeline, selected: Option<String>) {
        let name = selected.unwrap_or(self.fallback);
        let tls = pipeline.connection().tls();
        if !tls.is_negotiated() {
            tls.complete_alpn(name.clone());
        }
        let protocol = Protocol::from_alpn(&name);
        debug!(
            connection = %pipeline.connection().id(),
            alpn = %name,
            protocol = %protocol,
            "backend ALPN settled"
        );
        pipeline.install(protocol);
    }

    /// Handshake failed or the connection went away first
    pub(crate) fn fail(self, tls: &TlsNegotiationState, cause: Error) {
        if !tls.is_negotiated() {
            tls.fail(cause);
        }
    }
}
