//! Units exchanged between the client leg and a backend pipeline

use crate::h2::StreamFrame;
use bytes::Bytes;

/// A message travelling between the client leg and the backend leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// HTTP/2 frame tagged with a client-visible stream id
    Frame(StreamFrame),
    /// Opaque bytes: HTTP/1 wire data or raw forwarding
    Bytes(Bytes),
}

impl Message {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Frame(frame) => frame.kind().name(),
            Message::Bytes(_) => "bytes",
        }
    }
}

impl From<StreamFrame> for Message {
    fn from(frame: StreamFrame) -> Self {
        Message::Frame(frame)
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Message::Bytes(bytes)
    }
}
