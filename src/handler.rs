//! Protocol handler seam
//!
//! A backend pipeline runs exactly one [`ProtocolHandler`] once negotiation
//! settles. The handler sees plaintext only: TLS lives below it in the
//! pipeline, and the [`HandlerContext`] it is given writes through that
//! layer.

use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::pipeline::BackendPipeline;
use crate::protocol::Protocol;
use bytes::Bytes;
use std::sync::{Arc, Weak};

/// Protocol-specific bridge between the client leg and the origin
pub trait ProtocolHandler: Send + Sync {
    /// Protocol this handler speaks
    fn protocol(&self) -> Protocol;

    /// Called once when the handler replaces the negotiator, before any
    /// queued write is flushed into it
    fn installed(&self, ctx: &HandlerContext) -> Result<()>;

    /// Outbound message from the client leg
    fn write(&self, ctx: &HandlerContext, message: Message) -> Result<()>;

    /// Inbound plaintext from the origin
    fn read(&self, ctx: &HandlerContext, data: Bytes) -> Result<()>;

    /// The backend connection is gone
    fn inactive(&self, ctx: &HandlerContext);
}

/// What a handler may do to its pipeline
#[derive(Clone)]
pub struct HandlerContext {
    pipeline: Weak<BackendPipeline>,
    connection: Arc<ConnectionContext>,
}

impl HandlerContext {
    pub(crate) fn new(pipeline: Weak<BackendPipeline>, connection: Arc<ConnectionContext>) -> Self {
        HandlerContext {
            pipeline,
            connection,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.connection
    }

    /// Send plaintext toward the origin (encrypted if TLS is on)
    pub fn write(&self, data: Bytes) -> Result<()> {
        match self.pipeline.upgrade() {
            Some(pipeline) => pipeline.write_to_origin(data),
            None => Err(Error::ChannelClosed),
        }
    }

    /// Close the backend connection
    pub fn close(&self) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.close();
        }
    }

    pub fn is_active(&self) -> bool {
        self.pipeline
            .upgrade()
            .map_or(false, |pipeline| !pipeline.is_closed())
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("connection", &self.connection.id())
            .finish()
    }
}
