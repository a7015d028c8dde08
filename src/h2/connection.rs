//! Backend HTTP/2 connection state
//!
//! [`UpstreamConnection`] is the client-side HTTP/2 endpoint facing the
//! origin. It does no I/O: inbound bytes are pushed in with
//! [`receive`](UpstreamConnection::receive), outbound bytes accumulate until
//! [`take_outbound`](UpstreamConnection::take_outbound) is called. It owns
//! everything that is connection-scoped rather than stream-scoped: the
//! preface, SETTINGS exchange, PING replies, HPACK state, header block
//! assembly and flow control in both directions. DATA the origin's windows
//! cannot take yet is held per stream and sent as WINDOW_UPDATE or SETTINGS
//! frames grant credit.

use super::codec::FrameCodec;
use super::error::{Error, Result};
use super::flow_control::{InboundFlowControl, OutboundFlowControl};
use super::frames::*;
use super::settings::Settings;
use bytes::{Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

/// HTTP/2 connection preface (client magic)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// What the origin sent, after connection-level handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Frame to hand to the client leg, still on its upstream stream id
    Frame(StreamFrame),
    /// Frame consumed at connection level
    Ignored { frame: &'static str, stream_id: u32 },
}

/// Header block being assembled from HEADERS/PUSH_PROMISE + CONTINUATION
#[derive(Debug)]
struct PartialBlock {
    stream_id: u32,
    block: BytesMut,
    /// `None` for PUSH_PROMISE, whose headers are decoded and dropped
    headers: Option<HeadersMeta>,
}

/// Outbound work held back until the origin grants window
#[derive(Debug)]
enum Blocked {
    Data {
        data: Bytes,
        end_stream: bool,
        padding: Option<u8>,
    },
    /// Trailers queued behind blocked DATA; encoded only when sent so the
    /// HPACK state follows wire order
    Headers {
        headers: HeaderList,
        end_stream: bool,
        padding: Option<u8>,
        priority: Option<PrioritySpec>,
    },
}

#[derive(Debug, Clone, Copy)]
struct HeadersMeta {
    end_stream: bool,
    padding: Option<u8>,
    priority: Option<PrioritySpec>,
}

/// Client endpoint of the HTTP/2 connection to the origin
pub struct UpstreamConnection {
    codec: FrameCodec,
    local: Settings,
    remote: Settings,
    /// Local SETTINGS sent and not yet acknowledged, oldest first
    unacked: VecDeque<Settings>,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    flow: InboundFlowControl,
    send_flow: OutboundFlowControl,
    /// Held outbound frames in write order, tagged with their stream
    blocked: VecDeque<(u32, Blocked)>,
    partial: Option<PartialBlock>,
    read_buf: BytesMut,
    outbound: BytesMut,
    remote_settings_seen: bool,
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("buffered", &self.read_buf.len())
            .field("outbound", &self.outbound.len())
            .field("blocked", &self.blocked.len())
            .finish()
    }
}

impl UpstreamConnection {
    /// Create a connection that will announce `local` in its preface
    pub fn new(local: Settings) -> Self {
        UpstreamConnection {
            codec: FrameCodec::new(),
            local: Settings::new(),
            remote: Settings::new(),
            unacked: VecDeque::from([local]),
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            flow: InboundFlowControl::new(Settings::new().get_initial_window_size()),
            send_flow: OutboundFlowControl::new(Settings::new().get_initial_window_size()),
            blocked: VecDeque::new(),
            partial: None,
            read_buf: BytesMut::with_capacity(16 * 1024),
            outbound: BytesMut::with_capacity(16 * 1024),
            remote_settings_seen: false,
        }
    }

    /// Queue the client preface followed by our SETTINGS
    pub fn preface(&mut self) {
        self.outbound.extend_from_slice(CONNECTION_PREFACE);
        if let Some(local) = self.unacked.front() {
            FrameCodec::encode_settings(&SettingsFrame::new(local.clone()), &mut self.outbound);
        }
    }

    /// Settings in force for what we receive (acknowledged by the origin)
    pub fn local_settings(&self) -> &Settings {
        &self.local
    }

    /// Settings the origin announced
    pub fn remote_settings(&self) -> &Settings {
        &self.remote
    }

    /// True once the origin's first SETTINGS arrived
    pub fn is_ready(&self) -> bool {
        self.remote_settings_seen
    }

    /// Send windows granted by the origin
    pub fn send_flow(&self) -> &OutboundFlowControl {
        &self.send_flow
    }

    /// Number of outbound frames waiting for window
    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    /// Drain everything queued for the origin
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }

    /// Feed bytes read from the origin and return the resulting events
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<UpstreamEvent>> {
        self.read_buf.extend_from_slice(data);

        let mut events = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.read_buf)? {
            trace!(frame = frame.name(), stream_id = frame.stream_id(), "upstream frame");
            if !self.remote_settings_seen && !matches!(frame, Frame::Settings(ref s) if !s.ack) {
                return Err(Error::MissingPreface);
            }
            if let Some(event) = self.on_frame(frame)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Option<UpstreamEvent>> {
        if let Some(partial) = &self.partial {
            let expected = partial.stream_id;
            match &frame {
                Frame::Continuation(c) if c.stream_id == expected => {}
                _ => {
                    return Err(Error::Protocol(format!(
                        "expected CONTINUATION on stream {}, got {} on stream {}",
                        expected,
                        frame.name(),
                        frame.stream_id()
                    )))
                }
            }
        }

        let event = match frame {
            Frame::Data(data) => {
                self.flow.on_data(data.stream_id, data.flow_controlled_len())?;
                if data.end_stream {
                    self.flow.close_stream(data.stream_id);
                }
                Some(UpstreamEvent::Frame(StreamFrame::new(
                    data.stream_id,
                    FramePayload::Data {
                        data: data.data,
                        end_stream: data.end_stream,
                        padding: data.padding,
                    },
                )))
            }
            Frame::Headers(headers) => {
                let meta = HeadersMeta {
                    end_stream: headers.end_stream,
                    padding: headers.padding,
                    priority: headers.priority,
                };
                self.partial = Some(PartialBlock {
                    stream_id: headers.stream_id,
                    block: BytesMut::from(&headers.header_block[..]),
                    headers: Some(meta),
                });
                if headers.end_headers {
                    self.finish_block()?
                } else {
                    None
                }
            }
            Frame::PushPromise(promise) => {
                self.partial = Some(PartialBlock {
                    stream_id: promise.stream_id,
                    block: BytesMut::from(&promise.header_block[..]),
                    headers: None,
                });
                if promise.end_headers {
                    self.finish_block()?
                } else {
                    None
                }
            }
            Frame::Continuation(cont) => {
                match self.partial.as_mut() {
                    Some(partial) => partial.block.extend_from_slice(&cont.header_block),
                    None => {
                        return Err(Error::Protocol(format!(
                            "CONTINUATION on stream {} without a header block",
                            cont.stream_id
                        )))
                    }
                }
                if cont.end_headers {
                    self.finish_block()?
                } else {
                    None
                }
            }
            Frame::RstStream(rst) => {
                self.flow.close_stream(rst.stream_id);
                self.drop_stream(rst.stream_id);
                Some(UpstreamEvent::Frame(StreamFrame::new(
                    rst.stream_id,
                    FramePayload::RstStream {
                        error_code: rst.error_code,
                    },
                )))
            }
            Frame::Settings(settings) if settings.ack => {
                self.on_settings_ack()?;
                Some(ignored("SETTINGS_ACK", 0))
            }
            Frame::Settings(settings) => {
                self.remote.merge(&settings.settings);
                self.remote_settings_seen = true;
                FrameCodec::encode_settings(&SettingsFrame::ack(), &mut self.outbound);
                if let Some(initial) = settings.settings.initial_window_size {
                    self.send_flow.update_initial_window(initial)?;
                    self.flush_blocked()?;
                }
                Some(UpstreamEvent::Frame(StreamFrame::new(
                    0,
                    FramePayload::Settings(settings.settings),
                )))
            }
            Frame::Ping(ping) => {
                if !ping.ack {
                    FrameCodec::encode_ping(
                        &PingFrame {
                            ack: true,
                            data: ping.data,
                        },
                        &mut self.outbound,
                    );
                }
                Some(ignored(if ping.ack { "PING_ACK" } else { "PING" }, 0))
            }
            Frame::Goaway(goaway) => {
                debug!(
                    last_stream_id = goaway.last_stream_id,
                    error_code = goaway.error_code,
                    "origin sent GOAWAY"
                );
                Some(ignored("GOAWAY", 0))
            }
            Frame::WindowUpdate(update) => {
                self.send_flow
                    .increase(update.stream_id, update.size_increment)?;
                self.flush_blocked()?;
                Some(UpstreamEvent::Frame(StreamFrame::new(
                    update.stream_id,
                    FramePayload::WindowUpdate {
                        increment: update.size_increment,
                    },
                )))
            }
            Frame::Priority(priority) => Some(ignored("PRIORITY", priority.stream_id)),
            Frame::Unknown(header) => Some(ignored("UNKNOWN", header.stream_id)),
        };
        Ok(event)
    }

    /// Decode the assembled header block; HPACK state must see every block,
    /// including the ones that are dropped
    fn finish_block(&mut self) -> Result<Option<UpstreamEvent>> {
        let partial = match self.partial.take() {
            Some(partial) => partial,
            None => return Ok(None),
        };

        let decoded = self
            .decoder
            .decode(&partial.block)
            .map_err(|e| Error::Compression(format!("{:?}", e)))?;

        let meta = match partial.headers {
            Some(meta) => meta,
            None => return Ok(Some(ignored("PUSH_PROMISE", partial.stream_id))),
        };

        if meta.end_stream {
            self.flow.close_stream(partial.stream_id);
        }

        let headers = decoded
            .into_iter()
            .map(|(name, value)| (Bytes::from(name), Bytes::from(value)))
            .collect();
        Ok(Some(UpstreamEvent::Frame(StreamFrame::new(
            partial.stream_id,
            FramePayload::Headers {
                headers,
                end_stream: meta.end_stream,
                padding: meta.padding,
                priority: meta.priority,
            },
        ))))
    }

    fn on_settings_ack(&mut self) -> Result<()> {
        let acked = match self.unacked.pop_front() {
            Some(settings) => settings,
            None => {
                return Err(Error::Protocol(
                    "SETTINGS ACK without outstanding SETTINGS".into(),
                ))
            }
        };

        self.local.merge(&acked);
        self.codec = FrameCodec::with_max_frame_size(self.local.get_max_frame_size());
        if let Some(initial) = acked.initial_window_size {
            self.flow.update_initial_window(initial)?;
        }
        Ok(())
    }

    /// Encode a frame whose stream id is already the upstream one
    pub fn send(&mut self, frame: &StreamFrame) -> Result<()> {
        let stream_id = frame.stream_id;
        match &frame.payload {
            FramePayload::Data {
                data,
                end_stream,
                padding,
            } => {
                let mut data = data.clone();
                let sent = !self.is_blocked(stream_id)
                    && self.write_data(stream_id, &mut data, *end_stream, *padding);
                if !sent {
                    trace!(stream_id, remaining = data.len(), "DATA waiting for window");
                    self.blocked.push_back((
                        stream_id,
                        Blocked::Data {
                            data,
                            end_stream: *end_stream,
                            padding: *padding,
                        },
                    ));
                }
                Ok(())
            }
            FramePayload::Headers {
                headers,
                end_stream,
                padding,
                priority,
            } => {
                if self.is_blocked(stream_id) {
                    self.blocked.push_back((
                        stream_id,
                        Blocked::Headers {
                            headers: headers.clone(),
                            end_stream: *end_stream,
                            padding: *padding,
                            priority: *priority,
                        },
                    ));
                    Ok(())
                } else {
                    self.send_headers(stream_id, headers, *end_stream, *padding, *priority)
                }
            }
            FramePayload::RstStream { error_code } => {
                self.flow.close_stream(stream_id);
                self.drop_stream(stream_id);
                FrameCodec::encode_rst_stream(
                    &RstStreamFrame {
                        stream_id,
                        error_code: *error_code,
                    },
                    &mut self.outbound,
                );
                Ok(())
            }
            FramePayload::Settings(settings) => {
                settings.validate()?;
                FrameCodec::encode_settings(&SettingsFrame::new(settings.clone()), &mut self.outbound);
                self.unacked.push_back(settings.clone());
                Ok(())
            }
            FramePayload::WindowUpdate { increment } => {
                // Receive windows are replenished from processed DATA instead
                trace!(stream_id, increment, "dropping client WINDOW_UPDATE");
                Ok(())
            }
        }
    }

    fn is_blocked(&self, stream_id: u32) -> bool {
        self.blocked.iter().any(|(id, _)| *id == stream_id)
    }

    /// Discard held frames of a reset stream
    fn drop_stream(&mut self, stream_id: u32) {
        let before = self.blocked.len();
        self.blocked.retain(|(id, _)| *id != stream_id);
        if self.blocked.len() != before {
            debug!(
                stream_id,
                dropped = before - self.blocked.len(),
                "dropping held frames of reset stream"
            );
        }
        self.send_flow.close_stream(stream_id);
    }

    /// Encode as much of `data` as the windows and the origin's frame size
    /// allow. Returns true once the last frame went out; otherwise `data`
    /// holds what is left. Padding rides on the last frame only.
    fn write_data(
        &mut self,
        stream_id: u32,
        data: &mut Bytes,
        end_stream: bool,
        padding: Option<u8>,
    ) -> bool {
        let max_frame = self.remote.get_max_frame_size() as usize;
        let overhead = padding_overhead(padding);
        loop {
            let room = self.send_flow.capacity(stream_id).min(max_frame);
            if data.len() + overhead <= room {
                let frame = DataFrame {
                    stream_id,
                    data: std::mem::take(data),
                    end_stream,
                    padding,
                };
                self.send_flow.consume(stream_id, frame.flow_controlled_len());
                FrameCodec::encode_data(&frame, &mut self.outbound);
                if end_stream {
                    self.send_flow.close_stream(stream_id);
                }
                return true;
            }

            let len = data.len().min(room);
            if len == 0 {
                return false;
            }
            let frame = DataFrame::new(stream_id, data.split_to(len), false);
            self.send_flow.consume(stream_id, len);
            FrameCodec::encode_data(&frame, &mut self.outbound);
        }
    }

    /// Send held frames that now fit, keeping per-stream order
    fn flush_blocked(&mut self) -> Result<()> {
        if self.blocked.is_empty() {
            return Ok(());
        }

        let mut waiting = HashSet::new();
        let mut kept = VecDeque::with_capacity(self.blocked.len());
        while let Some((stream_id, mut item)) = self.blocked.pop_front() {
            if waiting.contains(&stream_id) {
                kept.push_back((stream_id, item));
                continue;
            }
            let done = match &mut item {
                Blocked::Data {
                    data,
                    end_stream,
                    padding,
                } => self.write_data(stream_id, data, *end_stream, *padding),
                Blocked::Headers {
                    headers,
                    end_stream,
                    padding,
                    priority,
                } => {
                    self.send_headers(stream_id, headers, *end_stream, *padding, *priority)?;
                    true
                }
            };
            if !done {
                waiting.insert(stream_id);
                kept.push_back((stream_id, item));
            }
        }
        self.blocked = kept;
        Ok(())
    }

    fn send_headers(
        &mut self,
        stream_id: u32,
        headers: &HeaderList,
        end_stream: bool,
        padding: Option<u8>,
        priority: Option<PrioritySpec>,
    ) -> Result<()> {
        let mut block = Bytes::from(
            self.encoder
                .encode(headers.iter().map(|(n, v)| (&n[..], &v[..]))),
        );

        let max = self.remote.get_max_frame_size() as usize;
        let first_room = max - padding_overhead(padding) - if priority.is_some() { 5 } else { 0 };
        let first = block.split_to(block.len().min(first_room));
        FrameCodec::encode_headers(
            &HeadersFrame {
                stream_id,
                header_block: first,
                end_stream,
                end_headers: block.is_empty(),
                priority,
                padding,
            },
            &mut self.outbound,
        );

        while !block.is_empty() {
            let fragment = block.split_to(block.len().min(max));
            FrameCodec::encode_continuation(
                &ContinuationFrame {
                    stream_id,
                    header_block: fragment,
                    end_headers: block.is_empty(),
                },
                &mut self.outbound,
            );
        }
        if end_stream {
            self.send_flow.close_stream(stream_id);
        }
        Ok(())
    }

    /// Report `processed` octets of DATA on `stream_id` as delivered,
    /// queueing any WINDOW_UPDATE that is now due
    pub fn consume_data(&mut self, stream_id: u32, processed: usize) {
        for update in self.flow.consume(stream_id, processed) {
            trace!(
                stream_id = update.stream_id,
                increment = update.size_increment,
                "replenishing receive window"
            );
            FrameCodec::encode_window_update(&update, &mut self.outbound);
        }
    }
}

fn ignored(frame: &'static str, stream_id: u32) -> UpstreamEvent {
    UpstreamEvent::Ignored { frame, stream_id }
}
