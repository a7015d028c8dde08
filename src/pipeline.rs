//! Backend pipeline
//!
//! One pipeline per origin connection. It starts out with a
//! [`BackendProtocolNegotiator`] and replaces it with exactly one
//! [`ProtocolHandler`] once the protocol is known:
//!
//! ```text
//!  client leg ──write──▶ Negotiating ──install──▶ Installed ──▶ Closed
//!                         (queues)                 (handler)
//! ```
//!
//! TLS sits between the stage and the [`Transport`]. Inbound ciphertext is
//! decrypted here and the stage only ever sees plaintext.

use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::handler::{HandlerContext, ProtocolHandler};
use crate::message::Message;
use crate::negotiator::{AlpnCompletion, BackendProtocolNegotiator};
use crate::protocol::Protocol;
use crate::tls::TlsSession;
use crate::transport::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

enum Stage {
    Negotiating(Arc<BackendProtocolNegotiator>),
    Installed(Arc<dyn ProtocolHandler>),
    Closed,
}

struct TlsLayer {
    session: TlsSession,
    /// Taken once the handshake completes or fails
    alpn: Option<AlpnCompletion>,
}

/// Where a message goes, decided under the stage lock and acted on after
enum Target {
    Negotiator(Arc<BackendProtocolNegotiator>),
    Handler(Arc<dyn ProtocolHandler>),
    Closed,
}

/// Backend half of a client↔origin connection pair
pub struct BackendPipeline {
    connection: Arc<ConnectionContext>,
    transport: Arc<dyn Transport>,
    stage: Mutex<Stage>,
    tls: Mutex<Option<TlsLayer>>,
    /// Serializes delivery of inbound plaintext, replay included
    inbound_order: Mutex<()>,
    closed: AtomicBool,
    this: Weak<BackendPipeline>,
}

impl BackendPipeline {
    pub fn new(connection: Arc<ConnectionContext>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|this| BackendPipeline {
            connection,
            transport,
            stage: Mutex::new(Stage::Negotiating(Arc::new(BackendProtocolNegotiator::new()))),
            tls: Mutex::new(None),
            inbound_order: Mutex::new(()),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Start negotiating; call once the transport is connected
    pub fn activate(&self) {
        let negotiator = match &*self.stage.lock() {
            Stage::Negotiating(negotiator) => negotiator.clone(),
            _ => return,
        };
        debug!(
            connection = %self.connection.id(),
            server = %self.connection.server_addr(),
            tls = self.connection.tls().is_enabled(),
            "backend connection active"
        );
        negotiator.handler_added(self);
    }

    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.connection
    }

    pub fn handler_context(&self) -> HandlerContext {
        HandlerContext::new(self.this.clone(), self.connection.clone())
    }

    pub(crate) fn downgrade(&self) -> Weak<BackendPipeline> {
        self.this.clone()
    }

    /// Protocol of the installed handler, if any
    pub fn protocol(&self) -> Option<Protocol> {
        match &*self.stage.lock() {
            Stage::Installed(handler) => Some(handler.protocol()),
            _ => None,
        }
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(&*self.stage.lock(), Stage::Negotiating(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn target(&self) -> Target {
        match &*self.stage.lock() {
            Stage::Negotiating(negotiator) => Target::Negotiator(negotiator.clone()),
            Stage::Installed(handler) => Target::Handler(handler.clone()),
            Stage::Closed => Target::Closed,
        }
    }

    /// Message from the client leg toward the origin
    pub fn write(&self, message: Message) {
        let ctx = self.handler_context();
        let outcome = match self.target() {
            Target::Negotiator(negotiator) => negotiator.write(&ctx, message),
            Target::Handler(handler) => handler.write(&ctx, message),
            Target::Closed => {
                warn!(
                    connection = %self.connection.id(),
                    message = message.kind(),
                    "write on closed backend, dropping"
                );
                return;
            }
        };
        if let Err(e) = outcome {
            self.on_error(e);
        }
    }

    /// Plaintext toward the origin, encrypted first when TLS is on
    pub fn write_to_origin(&self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.connection.tls().is_enabled() {
            return self.transport.write(&data).map_err(Error::Transport);
        }
        let mut tls = self.tls.lock();
        let layer = tls.as_mut().ok_or(Error::ChannelClosed)?;
        let ciphertext = layer.session.encrypt(&data)?;
        self.transport.write(&ciphertext).map_err(Error::Transport)
    }

    /// Start the TLS handshake with the origin, advertising the client
    /// side's protocols over ALPN
    pub(crate) fn configure_tls(&self, fallback: String) -> Result<()> {
        let protocols = self.connection.tls().protocols();
        let (session, client_hello) = TlsSession::connect(
            self.connection.config().tls(),
            &self.connection.server_addr().host,
            &protocols,
        )?;
        debug!(
            connection = %self.connection.id(),
            alpn = ?protocols,
            fallback = %fallback,
            "starting backend TLS handshake"
        );

        let mut tls = self.tls.lock();
        *tls = Some(TlsLayer {
            session,
            alpn: Some(AlpnCompletion::new(fallback)),
        });
        self.transport.write(&client_hello).map_err(Error::Transport)
    }

    /// Bytes read from the origin
    pub fn on_read(&self, data: Bytes) {
        if self.is_closed() {
            trace!(connection = %self.connection.id(), len = data.len(), "read after close");
            return;
        }
        if !self.connection.tls().is_enabled() {
            self.dispatch_inbound(data);
            return;
        }

        let (progress, completion) = {
            let mut tls = self.tls.lock();
            let layer = match tls.as_mut() {
                Some(layer) => layer,
                None => {
                    trace!(connection = %self.connection.id(), "no TLS session, dropping read");
                    return;
                }
            };
            match layer.session.read_tls(&data) {
                Ok(progress) => {
                    if let Some(outbound) = &progress.outbound {
                        if let Err(e) = self.transport.write(outbound) {
                            drop(tls);
                            self.on_error(Error::Transport(e));
                            return;
                        }
                    }
                    let completion = if progress.handshake_completed {
                        layer
                            .alpn
                            .take()
                            .map(|alpn| (alpn, layer.session.selected_alpn().map(String::from)))
                    } else {
                        None
                    };
                    (progress, completion)
                }
                Err(e) => {
                    let alpn = layer.alpn.take();
                    drop(tls);
                    if let Some(alpn) = alpn {
                        alpn.fail(self.connection.tls(), Error::Negotiation(e.to_string()));
                    }
                    self.on_error(e.into());
                    return;
                }
            }
        };

        if let Some((alpn, selected)) = completion {
            debug!(
                connection = %self.connection.id(),
                selected = ?selected,
                "backend TLS handshake complete"
            );
            alpn.complete(self, selected);
        }
        if let Some(plaintext) = progress.plaintext {
            self.dispatch_inbound(plaintext);
        }
        if progress.closed {
            debug!(connection = %self.connection.id(), "origin sent close_notify");
            self.close();
        }
    }

    fn dispatch_inbound(&self, data: Bytes) {
        let _order = self.inbound_order.lock();
        let (handler, data) = match self.target() {
            Target::Negotiator(negotiator) => match negotiator.hold_inbound(data) {
                Some(ready) => ready,
                None => return,
            },
            Target::Handler(handler) => (handler, data),
            Target::Closed => return,
        };
        if let Err(e) = handler.read(&self.handler_context(), data) {
            self.on_error(e);
        }
    }

    /// Replace the negotiator with the handler for `protocol`
    pub fn install(&self, protocol: Protocol) {
        let handler = match self.connection.provider().handler_for(protocol) {
            Ok(handler) => handler,
            Err(e) => {
                error!(connection = %self.connection.id(), error = %e, "Unsupported protocol");
                self.close();
                return;
            }
        };

        let ctx = self.handler_context();
        let order = self.inbound_order.lock();
        let held = {
            let mut stage = self.stage.lock();
            let negotiator = match &*stage {
                Stage::Negotiating(negotiator) => negotiator.clone(),
                Stage::Installed(current) => {
                    warn!(
                        connection = %self.connection.id(),
                        current = %current.protocol(),
                        requested = %protocol,
                        "handler already installed"
                    );
                    return;
                }
                Stage::Closed => return,
            };
            *stage = Stage::Installed(handler.clone());
            handler
                .installed(&ctx)
                .and_then(|()| negotiator.detach(&ctx, handler.clone()))
        };

        let held = match held {
            Ok(held) => held,
            Err(e) => {
                drop(order);
                self.on_error(e);
                return;
            }
        };
        debug!(connection = %self.connection.id(), %protocol, "protocol handler installed");

        for data in held {
            if let Err(e) = handler.read(&ctx, data) {
                drop(order);
                self.on_error(e);
                return;
            }
        }
    }

    /// Close the origin connection and tear the pipeline down
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let alert = self
            .tls
            .lock()
            .as_mut()
            .and_then(|layer| layer.session.shutdown());
        if let Some(alert) = alert {
            let _ = self.transport.write(&alert);
        }
        self.transport.close();
        self.on_inactive();
    }

    /// The origin connection is gone
    pub fn on_inactive(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close();
        let previous = std::mem::replace(&mut *self.stage.lock(), Stage::Closed);
        let pending_alpn = self.tls.lock().take().and_then(|layer| layer.alpn);
        if let Some(alpn) = pending_alpn {
            alpn.fail(self.connection.tls(), Error::ChannelClosed);
        }

        let ctx = self.handler_context();
        match previous {
            Stage::Negotiating(negotiator) => negotiator.inactive(&ctx),
            Stage::Installed(handler) => handler.inactive(&ctx),
            Stage::Closed => {}
        }
        debug!(connection = %self.connection.id(), "backend inactive");
    }

    /// Log and close; negotiation errors also fail the protocol
    pub fn on_error(&self, cause: Error) {
        match self.target() {
            Target::Negotiator(negotiator) => {
                negotiator.exception_caught(&self.connection, &cause)
            }
            Target::Handler(_) => {
                error!(connection = %self.connection.id(), error = %cause, "backend error")
            }
            Target::Closed => {
                trace!(connection = %self.connection.id(), error = %cause, "error after close");
                return;
            }
        }
        self.close();
    }
}

impl std::fmt::Debug for BackendPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match &*self.stage.lock() {
            Stage::Negotiating(_) => "negotiating".to_string(),
            Stage::Installed(handler) => format!("installed({})", handler.protocol()),
            Stage::Closed => "closed".to_string(),
        };
        f.debug_struct("BackendPipeline")
            .field("connection", &self.connection.id())
            .field("stage", &stage)
            .finish()
    }
}
