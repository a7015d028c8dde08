//! HTTP/2 protocol handler with stream id translation
//!
//! Client-leg frames carry whatever stream ids the client side uses. Each
//! backend connection allocates its own odd ids as frames go out, and
//! frames coming back are renumbered to the client's ids before they are
//! handed over. Frames written before the origin's first SETTINGS are held
//! in write order and sent, under the same lock as direct writes, right
//! after that SETTINGS is acknowledged.

use super::connection::{UpstreamConnection, UpstreamEvent};
use super::frames::{padding_overhead, FramePayload, StreamFrame};
use super::stream_map::StreamIdMap;
use crate::error::{Error, Result};
use crate::handler::{HandlerContext, ProtocolHandler};
use crate::message::Message;
use crate::promise::Promise;
use crate::protocol::Protocol;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Upstream {
    conn: Option<UpstreamConnection>,
    /// Frames written before the origin was ready
    deferred: VecDeque<StreamFrame>,
}

/// Bridges client-leg frames onto one HTTP/2 connection to the origin
pub struct Http2StreamTranslator {
    upstream: Mutex<Upstream>,
    streams: StreamIdMap,
    ready: Promise<()>,
}

impl Http2StreamTranslator {
    pub fn new() -> Self {
        Http2StreamTranslator {
            upstream: Mutex::new(Upstream::default()),
            streams: StreamIdMap::new(),
            ready: Promise::new(),
        }
    }

    /// Resolved once the origin's first SETTINGS arrived
    pub fn ready(&self) -> &Promise<()> {
        &self.ready
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_success()
    }

    pub fn streams(&self) -> &StreamIdMap {
        &self.streams
    }

    /// Allocate the upstream id and encode. Callers hold the upstream lock,
    /// so new streams reach the origin in increasing id order.
    fn encode(
        &self,
        ctx: &HandlerContext,
        conn: &mut UpstreamConnection,
        frame: StreamFrame,
    ) -> Result<()> {
        let origin_id = frame.stream_id;
        let upstream_id = self.streams.upstream_id(origin_id)?;
        trace!(
            connection = %ctx.connection().id(),
            frame = frame.kind().name(),
            origin_id,
            upstream_id,
            "outbound frame"
        );
        Ok(conn.send(&frame.with_stream_id(upstream_id))?)
    }

    fn send(&self, ctx: &HandlerContext, frame: StreamFrame) -> Result<()> {
        let mut upstream = self.upstream.lock();
        let Upstream { conn, deferred } = &mut *upstream;
        let conn = conn.as_mut().ok_or(Error::ChannelClosed)?;

        // Nothing may overtake a held frame
        if !conn.is_ready() || !deferred.is_empty() {
            trace!(
                connection = %ctx.connection().id(),
                stream_id = frame.stream_id,
                frame = frame.kind().name(),
                "origin not ready, deferring write"
            );
            deferred.push_back(frame);
            return Ok(());
        }

        self.encode(ctx, conn, frame)?;
        flush(conn, ctx)
    }

    fn consume(&self, ctx: &HandlerContext, upstream_id: u32, processed: usize) -> Result<()> {
        let mut upstream = self.upstream.lock();
        match upstream.conn.as_mut() {
            Some(conn) => {
                conn.consume_data(upstream_id, processed);
                flush(conn, ctx)
            }
            None => Ok(()),
        }
    }

    fn forward_inbound(&self, ctx: &HandlerContext, frame: StreamFrame) -> Result<()> {
        let upstream_id = frame.stream_id;
        let origin_id = self
            .streams
            .origin_id(upstream_id)
            .ok_or(Error::StreamConsistency(upstream_id))?;

        let processed = match &frame.payload {
            FramePayload::Data { data, padding, .. } => Some(data.len() + padding_overhead(*padding)),
            FramePayload::Settings(_) => {
                if self.ready.try_success(()) {
                    debug!(connection = %ctx.connection().id(), "origin HTTP/2 connection ready");
                }
                None
            }
            _ => None,
        };

        trace!(
            connection = %ctx.connection().id(),
            frame = frame.kind().name(),
            upstream_id,
            origin_id,
            "inbound frame"
        );
        ctx.connection()
            .client()
            .write(Message::Frame(frame.with_stream_id(origin_id)));

        match processed {
            Some(processed) => self.consume(ctx, upstream_id, processed),
            None => Ok(()),
        }
    }
}

fn flush(conn: &mut UpstreamConnection, ctx: &HandlerContext) -> Result<()> {
    match conn.take_outbound() {
        Some(bytes) => ctx.write(bytes),
        None => Ok(()),
    }
}

impl Default for Http2StreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler for Http2StreamTranslator {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn installed(&self, ctx: &HandlerContext) -> Result<()> {
        let settings = ctx.connection().config().h2_settings().clone();
        let mut upstream = self.upstream.lock();
        let conn = upstream.conn.insert(UpstreamConnection::new(settings));
        conn.preface();
        flush(conn, ctx)?;
        debug!(connection = %ctx.connection().id(), "HTTP/2 preface sent");
        Ok(())
    }

    fn write(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        match message {
            Message::Bytes(bytes) => ctx.write(bytes),
            Message::Frame(frame) => self.send(ctx, frame),
        }
    }

    fn read(&self, ctx: &HandlerContext, data: Bytes) -> Result<()> {
        let events = {
            let mut upstream = self.upstream.lock();
            let Upstream { conn, deferred } = &mut *upstream;
            let conn = conn.as_mut().ok_or(Error::ChannelClosed)?;
            let events = conn.receive(&data)?;
            if conn.is_ready() && !deferred.is_empty() {
                debug!(
                    connection = %ctx.connection().id(),
                    count = deferred.len(),
                    "sending deferred writes"
                );
                while let Some(frame) = deferred.pop_front() {
                    self.encode(ctx, conn, frame)?;
                }
            }
            flush(conn, ctx)?;
            events
        };

        for event in events {
            match event {
                UpstreamEvent::Frame(frame) => self.forward_inbound(ctx, frame)?,
                UpstreamEvent::Ignored { frame, stream_id } => trace!(
                    connection = %ctx.connection().id(),
                    frame,
                    stream_id,
                    "not forwarded"
                ),
            }
        }
        Ok(())
    }

    fn inactive(&self, ctx: &HandlerContext) {
        if self.ready.try_failure(Error::ChannelClosed) {
            debug!(
                connection = %ctx.connection().id(),
                "closed before origin SETTINGS"
            );
        }
        ctx.connection().client().close();
        let dropped = {
            let mut upstream = self.upstream.lock();
            upstream.conn = None;
            std::mem::take(&mut upstream.deferred).len()
        };
        debug!(
            connection = %ctx.connection().id(),
            streams = self.streams.len(),
            dropped,
            "HTTP/2 backend inactive"
        );
    }
}

impl std::fmt::Debug for Http2StreamTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2StreamTranslator")
            .field("ready", &self.is_ready())
            .field("streams", &self.streams.len())
            .finish()
    }
}
