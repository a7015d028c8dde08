//! HTTP/2 frame encoding and decoding
//!
//! Encoders append complete frames to a caller-owned `BytesMut`. The decoder
//! is incremental: it is handed whatever bytes have arrived so far and yields
//! a frame once a whole one is buffered, validating frame size and the
//! stream-id rules of RFC 7540 Section 6 on the way.

use super::error::{Error, Result};
use super::frames::*;
use super::settings::{Settings, DEFAULT_MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Frame codec for encoding/decoding HTTP/2 frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Largest payload this side accepts (our SETTINGS_MAX_FRAME_SIZE)
    max_frame_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        FrameCodec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Encode a frame header
    pub fn encode_header(header: &FrameHeader, dst: &mut BytesMut) {
        let length = header.length as usize;
        dst.put_u8(((length >> 16) & 0xFF) as u8);
        dst.put_u8(((length >> 8) & 0xFF) as u8);
        dst.put_u8((length & 0xFF) as u8);
        dst.put_u8(header.frame_type);
        dst.put_u8(header.flags.as_u8());
        dst.put_u32(header.stream_id & 0x7FFF_FFFF);
    }

    /// Decode a frame header; the type octet is kept raw so extension
    /// frames can be skipped instead of misread
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_LEN]) -> FrameHeader {
        let length =
            ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32);
        let stream_id = ((bytes[5] as u32 & 0x7F) << 24)
            | ((bytes[6] as u32) << 16)
            | ((bytes[7] as u32) << 8)
            | (bytes[8] as u32);

        FrameHeader {
            length,
            frame_type: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Try to decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `src` only when a frame is produced.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let header = Self::decode_header(&raw);

        if header.length > self.max_frame_size {
            return Err(Error::FrameSize(format!(
                "frame of {} octets exceeds max frame size {}",
                header.length, self.max_frame_size
            )));
        }

        let total = FRAME_HEADER_LEN + header.length as usize;
        if src.len() < total {
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(header.length as usize).freeze();
        Self::decode_payload(header, payload).map(Some)
    }

    fn decode_payload(header: FrameHeader, mut payload: Bytes) -> Result<Frame> {
        let flags = header.flags;
        let stream_id = header.stream_id;

        let kind = match header.kind() {
            Some(kind) => kind,
            None => return Ok(Frame::Unknown(header)),
        };

        match kind {
            FrameType::Data => {
                require_stream(kind, stream_id)?;
                let padding = strip_padding(flags, &mut payload)?;
                Ok(Frame::Data(DataFrame {
                    stream_id,
                    data: payload,
                    end_stream: flags.is_end_stream(),
                    padding,
                }))
            }
            FrameType::Headers => {
                require_stream(kind, stream_id)?;
                let padding = strip_padding(flags, &mut payload)?;
                let priority = if flags.is_priority() {
                    if payload.len() < 5 {
                        return Err(Error::FrameSize("HEADERS priority block truncated".into()));
                    }
                    Some(read_priority(&mut payload))
                } else {
                    None
                };
                Ok(Frame::Headers(HeadersFrame {
                    stream_id,
                    header_block: payload,
                    end_stream: flags.is_end_stream(),
                    end_headers: flags.is_end_headers(),
                    priority,
                    padding,
                }))
            }
            FrameType::Priority => {
                require_stream(kind, stream_id)?;
                require_len(kind, &payload, 5)?;
                Ok(Frame::Priority(PriorityFrame {
                    stream_id,
                    priority: read_priority(&mut payload),
                }))
            }
            FrameType::RstStream => {
                require_stream(kind, stream_id)?;
                require_len(kind, &payload, 4)?;
                Ok(Frame::RstStream(RstStreamFrame {
                    stream_id,
                    error_code: payload.get_u32(),
                }))
            }
            FrameType::Settings => {
                require_connection(kind, stream_id)?;
                if flags.is_ack() {
                    require_len(kind, &payload, 0)?;
                    return Ok(Frame::Settings(SettingsFrame::ack()));
                }
                Ok(Frame::Settings(SettingsFrame::new(Settings::decode_payload(
                    &payload,
                )?)))
            }
            FrameType::PushPromise => {
                require_stream(kind, stream_id)?;
                strip_padding(flags, &mut payload)?;
                if payload.len() < 4 {
                    return Err(Error::FrameSize("PUSH_PROMISE truncated".into()));
                }
                let promised_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                Ok(Frame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id,
                    header_block: payload,
                    end_headers: flags.is_end_headers(),
                }))
            }
            FrameType::Ping => {
                require_connection(kind, stream_id)?;
                require_len(kind, &payload, 8)?;
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                Ok(Frame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                }))
            }
            FrameType::Goaway => {
                require_connection(kind, stream_id)?;
                if payload.len() < 8 {
                    return Err(Error::FrameSize("GOAWAY truncated".into()));
                }
                let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                let error_code = payload.get_u32();
                Ok(Frame::Goaway(GoawayFrame {
                    last_stream_id,
                    error_code,
                    debug_data: payload,
                }))
            }
            FrameType::WindowUpdate => {
                require_len(kind, &payload, 4)?;
                let size_increment = payload.get_u32() & 0x7FFF_FFFF;
                if size_increment == 0 {
                    return Err(Error::Protocol(format!(
                        "WINDOW_UPDATE with zero increment on stream {}",
                        stream_id
                    )));
                }
                Ok(Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id,
                    size_increment,
                }))
            }
            FrameType::Continuation => {
                require_stream(kind, stream_id)?;
                Ok(Frame::Continuation(ContinuationFrame {
                    stream_id,
                    header_block: payload,
                    end_headers: flags.is_end_headers(),
                }))
            }
        }
    }

    /// Encode a DATA frame
    pub fn encode_data(frame: &DataFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        flags.set_if(FrameFlags::PADDED, frame.padding.is_some());

        let length = frame.flow_controlled_len() as u32;
        Self::encode_header(
            &FrameHeader::new(FrameType::Data, flags, frame.stream_id, length),
            dst,
        );
        put_padded(dst, frame.padding, |dst| dst.put_slice(&frame.data));
    }

    /// Encode a HEADERS frame
    pub fn encode_headers(frame: &HeadersFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        flags.set_if(FrameFlags::PRIORITY, frame.priority.is_some());
        flags.set_if(FrameFlags::PADDED, frame.padding.is_some());

        let mut length = frame.header_block.len() + padding_overhead(frame.padding);
        if frame.priority.is_some() {
            length += 5;
        }
        Self::encode_header(
            &FrameHeader::new(FrameType::Headers, flags, frame.stream_id, length as u32),
            dst,
        );
        put_padded(dst, frame.padding, |dst| {
            if let Some(priority) = &frame.priority {
                write_priority(priority, dst);
            }
            dst.put_slice(&frame.header_block);
        });
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation(frame: &ContinuationFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        Self::encode_header(
            &FrameHeader::new(
                FrameType::Continuation,
                flags,
                frame.stream_id,
                frame.header_block.len() as u32,
            ),
            dst,
        );
        dst.put_slice(&frame.header_block);
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings(frame: &SettingsFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, frame.ack);

        let length = if frame.ack { 0 } else { frame.settings.payload_len() };
        Self::encode_header(
            &FrameHeader::new(FrameType::Settings, flags, 0, length as u32),
            dst,
        );
        if !frame.ack {
            frame.settings.encode_payload(dst);
        }
    }

    /// Encode a PING frame
    pub fn encode_ping(frame: &PingFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, frame.ack);
        Self::encode_header(&FrameHeader::new(FrameType::Ping, flags, 0, 8), dst);
        dst.put_slice(&frame.data);
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway(frame: &GoawayFrame, dst: &mut BytesMut) {
        let length = 8 + frame.debug_data.len();
        Self::encode_header(
            &FrameHeader::new(FrameType::Goaway, FrameFlags::empty(), 0, length as u32),
            dst,
        );
        dst.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        dst.put_u32(frame.error_code);
        dst.put_slice(&frame.debug_data);
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update(frame: &WindowUpdateFrame, dst: &mut BytesMut) {
        Self::encode_header(
            &FrameHeader::new(FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4),
            dst,
        );
        dst.put_u32(frame.size_increment & 0x7FFF_FFFF);
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream(frame: &RstStreamFrame, dst: &mut BytesMut) {
        Self::encode_header(
            &FrameHeader::new(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4),
            dst,
        );
        dst.put_u32(frame.error_code);
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority(frame: &PriorityFrame, dst: &mut BytesMut) {
        Self::encode_header(
            &FrameHeader::new(FrameType::Priority, FrameFlags::empty(), frame.stream_id, 5),
            dst,
        );
        write_priority(&frame.priority, dst);
    }

    /// Encode any wire frame
    pub fn encode(frame: &Frame, dst: &mut BytesMut) {
        match frame {
            Frame::Data(f) => Self::encode_data(f, dst),
            Frame::Headers(f) => Self::encode_headers(f, dst),
            Frame::Priority(f) => Self::encode_priority(f, dst),
            Frame::RstStream(f) => Self::encode_rst_stream(f, dst),
            Frame::Settings(f) => Self::encode_settings(f, dst),
            Frame::Ping(f) => Self::encode_ping(f, dst),
            Frame::Goaway(f) => Self::encode_goaway(f, dst),
            Frame::WindowUpdate(f) => Self::encode_window_update(f, dst),
            Frame::Continuation(f) => Self::encode_continuation(f, dst),
            Frame::PushPromise(f) => {
                let mut flags = FrameFlags::empty();
                flags.set_if(FrameFlags::END_HEADERS, f.end_headers);
                let length = 4 + f.header_block.len();
                Self::encode_header(
                    &FrameHeader::new(FrameType::PushPromise, flags, f.stream_id, length as u32),
                    dst,
                );
                dst.put_u32(f.promised_stream_id & 0x7FFF_FFFF);
                dst.put_slice(&f.header_block);
            }
            // Extension frames carry no payload we kept
            Frame::Unknown(header) => {
                let mut empty = *header;
                empty.length = 0;
                Self::encode_header(&empty, dst);
            }
        }
    }
}

fn require_stream(kind: FrameType, stream_id: u32) -> Result<()> {
    if stream_id == 0 {
        return Err(Error::InvalidStreamId {
            stream_id,
            frame: kind.name(),
        });
    }
    Ok(())
}

fn require_connection(kind: FrameType, stream_id: u32) -> Result<()> {
    if stream_id != 0 {
        return Err(Error::InvalidStreamId {
            stream_id,
            frame: kind.name(),
        });
    }
    Ok(())
}

fn require_len(kind: FrameType, payload: &Bytes, expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(Error::FrameSize(format!(
            "{} payload must be {} octets, got {}",
            kind.name(),
            expected,
            payload.len()
        )));
    }
    Ok(())
}

/// Remove the pad length field and trailing padding, returning the pad length
fn strip_padding(flags: FrameFlags, payload: &mut Bytes) -> Result<Option<u8>> {
    if !flags.is_padded() {
        return Ok(None);
    }
    if payload.is_empty() {
        return Err(Error::Protocol("PADDED frame without pad length".into()));
    }
    let pad_len = payload.get_u8();
    if pad_len as usize > payload.len() {
        return Err(Error::Protocol(format!(
            "padding of {} exceeds remaining payload {}",
            pad_len,
            payload.len()
        )));
    }
    payload.truncate(payload.len() - pad_len as usize);
    Ok(Some(pad_len))
}

fn put_padded(dst: &mut BytesMut, padding: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(pad_len) = padding {
        dst.put_u8(pad_len);
    }
    body(dst);
    if let Some(pad_len) = padding {
        dst.put_bytes(0, pad_len as usize);
    }
}

fn read_priority(payload: &mut Bytes) -> PrioritySpec {
    let dep = payload.get_u32();
    let weight = payload.get_u8();
    PrioritySpec::new(dep & 0x7FFF_FFFF, dep & 0x8000_0000 != 0, weight)
}

fn write_priority(priority: &PrioritySpec, dst: &mut BytesMut) {
    let mut dep = priority.stream_dependency & 0x7FFF_FFFF;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    dst.put_u32(dep);
    dst.put_u8(priority.weight);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::settings::SettingsBuilder;

    fn decode_one(buf: &[u8]) -> Result<Option<Frame>> {
        let mut src = BytesMut::from(buf);
        FrameCodec::new().decode(&mut src)
    }

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        let header = FrameHeader::new(
            FrameType::Headers,
            FrameFlags::from_u8(FrameFlags::END_HEADERS),
            0x8000_0003,
            0x01_02_03,
        );
        FrameCodec::encode_header(&header, &mut buf);
        assert_eq!(&buf[..], &[0x01, 0x02, 0x03, 0x01, 0x04, 0, 0, 0, 3]);

        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw.copy_from_slice(&buf);
        let decoded = FrameCodec::decode_header(&raw);
        assert_eq!(decoded.stream_id, 3);
        assert_eq!(decoded.kind(), Some(FrameType::Headers));
    }

    #[test]
    fn test_partial_input_waits() {
        let mut buf = BytesMut::new();
        FrameCodec::encode_data(&DataFrame::new(1, Bytes::from("hello"), false), &mut buf);

        let codec = FrameCodec::new();
        let mut partial = BytesMut::from(&buf[..7]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        assert_eq!(partial.len(), 7);

        let mut partial = BytesMut::from(&buf[..12]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        let mut whole = buf.clone();
        assert!(codec.decode(&mut whole).unwrap().is_some());
        assert!(whole.is_empty());
    }

    #[test]
    fn test_padded_data_decodes() {
        let mut buf = BytesMut::new();
        let frame = DataFrame::new(5, Bytes::from("abc"), true).with_padding(4);
        FrameCodec::encode_data(&frame, &mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 8);

        match decode_one(&buf).unwrap() {
            Some(Frame::Data(data)) => {
                assert_eq!(data.data, Bytes::from("abc"));
                assert_eq!(data.padding, Some(4));
                assert!(data.end_stream);
                assert_eq!(data.flow_controlled_len(), 8);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_headers_with_priority_decodes() {
        let mut buf = BytesMut::new();
        let frame = HeadersFrame {
            stream_id: 3,
            header_block: Bytes::from_static(&[0x82]),
            end_stream: false,
            end_headers: true,
            priority: Some(PrioritySpec::new(1, true, 15)),
            padding: None,
        };
        FrameCodec::encode_headers(&frame, &mut buf);
        assert_eq!(decode_one(&buf).unwrap(), Some(Frame::Headers(frame)));
    }

    #[test]
    fn test_settings_and_ack() {
        let settings = SettingsBuilder::new().initial_window_size(1 << 20).build().unwrap();
        let mut buf = BytesMut::new();
        FrameCodec::encode_settings(&SettingsFrame::new(settings.clone()), &mut buf);
        FrameCodec::encode_settings(&SettingsFrame::ack(), &mut buf);

        let codec = FrameCodec::new();
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Settings(SettingsFrame::new(settings)))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Settings(SettingsFrame::ack()))
        );
    }

    #[test]
    fn test_unknown_type_is_skipped_not_misread() {
        let mut buf = BytesMut::new();
        let header = FrameHeader {
            length: 3,
            frame_type: 0xfa,
            flags: FrameFlags::empty(),
            stream_id: 1,
        };
        FrameCodec::encode_header(&header, &mut buf);
        buf.put_slice(b"xyz");
        FrameCodec::encode_ping(&PingFrame { ack: false, data: [7; 8] }, &mut buf);

        let codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Unknown(header)));
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Frame::Ping(_))));
    }

    #[test]
    fn test_stream_id_rules() {
        let mut buf = BytesMut::new();
        FrameCodec::encode_data(&DataFrame::new(0, Bytes::new(), false), &mut buf);
        assert!(matches!(
            decode_one(&buf),
            Err(Error::InvalidStreamId { stream_id: 0, frame: "DATA" })
        ));

        let mut buf = BytesMut::new();
        let header = FrameHeader::new(FrameType::Ping, FrameFlags::empty(), 1, 8);
        FrameCodec::encode_header(&header, &mut buf);
        buf.put_bytes(0, 8);
        assert!(matches!(
            decode_one(&buf),
            Err(Error::InvalidStreamId { stream_id: 1, frame: "PING" })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        let header = FrameHeader::new(FrameType::Data, FrameFlags::empty(), 1, 16385);
        FrameCodec::encode_header(&header, &mut buf);
        assert!(matches!(decode_one(&buf), Err(Error::FrameSize(_))));

        let mut buf2 = BytesMut::from(&buf[..]);
        buf2.put_bytes(0, 16385);
        let codec = FrameCodec::with_max_frame_size(32768);
        assert!(codec.decode(&mut buf2).unwrap().is_some());
    }

    #[test]
    fn test_bad_padding_rejected() {
        let mut buf = BytesMut::new();
        let header = FrameHeader::new(
            FrameType::Data,
            FrameFlags::from_u8(FrameFlags::PADDED),
            1,
            2,
        );
        FrameCodec::encode_header(&header, &mut buf);
        buf.put_slice(&[5, b'a']);
        assert!(matches!(decode_one(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_zero_window_update_rejected() {
        let mut buf = BytesMut::new();
        FrameCodec::encode_window_update(
            &WindowUpdateFrame { stream_id: 0, size_increment: 0 },
            &mut buf,
        );
        assert!(matches!(decode_one(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_goaway_and_rst_carry_raw_codes() {
        let mut buf = BytesMut::new();
        FrameCodec::encode_goaway(
            &GoawayFrame {
                last_stream_id: 9,
                error_code: 0x1234,
                debug_data: Bytes::from("bye"),
            },
            &mut buf,
        );
        FrameCodec::encode_rst_stream(
            &RstStreamFrame { stream_id: 3, error_code: 0x8 },
            &mut buf,
        );

        let codec = FrameCodec::new();
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Goaway(goaway)) => {
                assert_eq!(goaway.last_stream_id, 9);
                assert_eq!(goaway.error_code, 0x1234);
                assert_eq!(goaway.debug_data, Bytes::from("bye"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::RstStream(RstStreamFrame { stream_id: 3, error_code: 0x8 }))
        );
    }
}
