//! HTTP/2 frame types
//!
//! Two layers live here. The wire layer ([`FrameHeader`], [`Frame`] and the
//! per-type structs) mirrors RFC 7540 Section 6 and is what the codec reads
//! and writes. The message layer ([`StreamFrame`], [`FramePayload`]) is what
//! travels between the client leg and the stream translator: decoded header
//! lists instead of HPACK fragments, tagged with a stream id that may still
//! need translating.

use super::settings::Settings;
use bytes::Bytes;
use std::fmt;

/// Size of the fixed frame header
pub const FRAME_HEADER_LEN: usize = 9;

/// HTTP/2 frame types (RFC 7540 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    /// Convert frame type to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create frame type from u8; extension types yield `None`
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// END_STREAM flag (0x1)
    pub const END_STREAM: u8 = 0x1;
    /// ACK flag (0x1) - used for SETTINGS and PING
    pub const ACK: u8 = 0x1;
    /// END_HEADERS flag (0x4)
    pub const END_HEADERS: u8 = 0x4;
    /// PADDED flag (0x8)
    pub const PADDED: u8 = 0x8;
    /// PRIORITY flag (0x20)
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Set `flag` when `on` is true
    pub fn set_if(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        }
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// The 9-octet header that precedes every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length (24 bits)
    pub length: u32,
    /// Raw type octet; types unknown to [`FrameType`] must be ignored
    pub frame_type: u8,
    pub flags: FrameFlags,
    /// Stream identifier with the reserved bit cleared
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: u32) -> Self {
        FrameHeader {
            length,
            frame_type: frame_type.as_u8(),
            flags,
            stream_id,
        }
    }

    pub fn kind(&self) -> Option<FrameType> {
        FrameType::from_u8(self.frame_type)
    }
}

/// Priority specification (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    /// Stream dependency
    pub stream_dependency: u32,
    /// Exclusive flag
    pub exclusive: bool,
    /// Weight as sent on the wire (0-255, meaning 1-256)
    pub weight: u8,
}

impl PrioritySpec {
    pub fn new(stream_dependency: u32, exclusive: bool, weight: u8) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }
}

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    /// Pad length field (if PADDED flag is set)
    pub padding: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Octets counted against flow control: data plus the pad length
    /// field and the padding itself
    pub fn flow_controlled_len(&self) -> usize {
        self.data.len() + padding_overhead(self.padding)
    }
}

/// HEADERS frame (RFC 7540 Section 6.2), carrying an encoded fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PrioritySpec>,
    pub padding: Option<u8>,
}

/// PRIORITY frame (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub priority: PrioritySpec,
}

/// RST_STREAM frame (RFC 7540 Section 6.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    /// Raw error code; peers may send codes outside RFC 7540
    pub error_code: u32,
}

/// SETTINGS frame (RFC 7540 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::new(),
        }
    }
}

/// PUSH_PROMISE frame (RFC 7540 Section 6.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    pub stream_id: u32,
    pub promised_stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayFrame {
    pub last_stream_id: u32,
    pub error_code: u32,
    pub debug_data: Bytes,
}

/// WINDOW_UPDATE frame (RFC 7540 Section 6.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    /// Stream ID (0 for connection-level)
    pub stream_id: u32,
    pub size_increment: u32,
}

/// CONTINUATION frame (RFC 7540 Section 6.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
}

/// A decoded wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    Goaway(GoawayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    /// Extension frame type; its payload has already been skipped
    Unknown(FrameHeader),
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers(f) => f.stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::RstStream(f) => f.stream_id,
            Frame::PushPromise(f) => f.stream_id,
            Frame::WindowUpdate(f) => f.stream_id,
            Frame::Continuation(f) => f.stream_id,
            Frame::Unknown(h) => h.stream_id,
            Frame::Settings(_) | Frame::Ping(_) | Frame::Goaway(_) => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Data(_) => "DATA",
            Frame::Headers(_) => "HEADERS",
            Frame::Priority(_) => "PRIORITY",
            Frame::RstStream(_) => "RST_STREAM",
            Frame::Settings(_) => "SETTINGS",
            Frame::PushPromise(_) => "PUSH_PROMISE",
            Frame::Ping(_) => "PING",
            Frame::Goaway(_) => "GOAWAY",
            Frame::WindowUpdate(_) => "WINDOW_UPDATE",
            Frame::Continuation(_) => "CONTINUATION",
            Frame::Unknown(_) => "UNKNOWN",
        }
    }
}

/// A decoded header field list, in wire order
pub type HeaderList = Vec<(Bytes, Bytes)>;

/// Build a [`HeaderList`] from string pairs
pub fn header_list<'a, I>(fields: I) -> HeaderList
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    fields
        .into_iter()
        .map(|(n, v)| {
            (
                Bytes::copy_from_slice(n.as_bytes()),
                Bytes::copy_from_slice(v.as_bytes()),
            )
        })
        .collect()
}

/// Frame content exchanged with the client leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Data {
        data: Bytes,
        end_stream: bool,
        /// Pad length field, if the frame is padded
        padding: Option<u8>,
    },
    Headers {
        headers: HeaderList,
        end_stream: bool,
        padding: Option<u8>,
        priority: Option<PrioritySpec>,
    },
    RstStream {
        error_code: u32,
    },
    Settings(Settings),
    WindowUpdate {
        increment: u32,
    },
}

/// A frame tagged with the stream id of whichever side it is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u32,
    pub payload: FramePayload,
}

impl StreamFrame {
    pub fn new(stream_id: u32, payload: FramePayload) -> Self {
        StreamFrame { stream_id, payload }
    }

    pub fn data(stream_id: u32, data: impl Into<Bytes>, end_stream: bool) -> Self {
        StreamFrame::new(
            stream_id,
            FramePayload::Data {
                data: data.into(),
                end_stream,
                padding: None,
            },
        )
    }

    pub fn headers(stream_id: u32, headers: HeaderList, end_stream: bool) -> Self {
        StreamFrame::new(
            stream_id,
            FramePayload::Headers {
                headers,
                end_stream,
                padding: None,
                priority: None,
            },
        )
    }

    /// Same payload, different stream id
    pub fn with_stream_id(self, stream_id: u32) -> Self {
        StreamFrame {
            stream_id,
            payload: self.payload,
        }
    }

    pub fn kind(&self) -> FrameType {
        match self.payload {
            FramePayload::Data { .. } => FrameType::Data,
            FramePayload::Headers { .. } => FrameType::Headers,
            FramePayload::RstStream { .. } => FrameType::RstStream,
            FramePayload::Settings(_) => FrameType::Settings,
            FramePayload::WindowUpdate { .. } => FrameType::WindowUpdate,
        }
    }
}

/// Pad length field plus padding octets
pub(crate) fn padding_overhead(padding: Option<u8>) -> usize {
    padding.map_or(0, |pad| 1 + pad as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::Continuation.as_u8(), 0x9);
        assert_eq!(FrameType::from_u8(0x0), Some(FrameType::Data));
        assert_eq!(FrameType::from_u8(0xff), None);
        assert_eq!(FrameType::Goaway.to_string(), "GOAWAY (0x7)");
    }

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, true);
        flags.set_if(FrameFlags::PADDED, false);
        assert!(flags.is_end_stream());
        assert!(!flags.is_padded());
        assert_eq!(flags.as_u8(), 0x1);
    }

    #[test]
    fn test_data_frame_flow_controlled_len() {
        let frame = DataFrame::new(1, Bytes::from("Hello"), true);
        assert_eq!(frame.flow_controlled_len(), 5);
        assert_eq!(frame.with_padding(10).flow_controlled_len(), 16);
    }

    #[test]
    fn test_connection_frames_have_stream_zero() {
        assert_eq!(Frame::Settings(SettingsFrame::ack()).stream_id(), 0);
        let ping = Frame::Ping(PingFrame { ack: false, data: [0; 8] });
        assert_eq!(ping.stream_id(), 0);
        assert_eq!(ping.name(), "PING");
    }

    #[test]
    fn test_stream_frame_retag() {
        let frame = StreamFrame::data(7, "body", true);
        let moved = frame.clone().with_stream_id(1);
        assert_eq!(moved.stream_id, 1);
        assert_eq!(moved.payload, frame.payload);
        assert_eq!(moved.kind(), FrameType::Data);
    }

    #[test]
    fn test_header_list_helper() {
        let headers = header_list([(":method", "GET"), (":path", "/")]);
        assert_eq!(headers.len(), 2);
        assert_eq!(&headers[0].0[..], b":method");
    }
}
