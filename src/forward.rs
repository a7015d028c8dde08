//! Byte pass-through handler
//!
//! Used for raw forwarding and for HTTP/1, whose codec lives on the client
//! leg: bytes go to the origin untouched and whatever the origin sends is
//! handed back as bytes.

use crate::error::{Error, Result};
use crate::handler::{HandlerContext, ProtocolHandler};
use crate::message::Message;
use crate::protocol::Protocol;
use bytes::Bytes;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub struct ForwardHandler {
    protocol: Protocol,
}

impl ForwardHandler {
    pub fn new(protocol: Protocol) -> Self {
        ForwardHandler { protocol }
    }
}

impl ProtocolHandler for ForwardHandler {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn installed(&self, ctx: &HandlerContext) -> Result<()> {
        debug!(connection = %ctx.connection().id(), protocol = %self.protocol, "forwarding bytes");
        Ok(())
    }

    fn write(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        match message {
            Message::Bytes(bytes) => {
                trace!(connection = %ctx.connection().id(), len = bytes.len(), "to origin");
                ctx.write(bytes)
            }
            Message::Frame(frame) => Err(Error::UnexpectedMessage(frame.kind().name())),
        }
    }

    fn read(&self, ctx: &HandlerContext, data: Bytes) -> Result<()> {
        trace!(connection = %ctx.connection().id(), len = data.len(), "from origin");
        ctx.connection().client().write(Message::Bytes(data));
        Ok(())
    }

    fn inactive(&self, ctx: &HandlerContext) {
        ctx.connection().client().close();
    }
}
