//! In-memory doubles for driving a pipeline without sockets
//!
//! Used by this crate's own tests and handy for embedders testing their
//! client leg against a scripted origin.

use crate::context::ClientLeg;
use crate::message::Message;
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Transport that records everything written to it
#[derive(Debug)]
pub struct RecordingTransport {
    written: Mutex<BytesMut>,
    open: AtomicBool,
    closes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        RecordingTransport {
            written: Mutex::new(BytesMut::new()),
            open: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Everything written since the last call
    pub fn take_written(&self) -> Bytes {
        self.written.lock().split().freeze()
    }

    pub fn written_len(&self) -> usize {
        self.written.lock().len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail with `BrokenPipe`
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RecordingTransport {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
        }
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        self.written.lock().extend_from_slice(data);
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Client leg that records what the backend hands it
#[derive(Debug, Default)]
pub struct RecordingClientLeg {
    messages: Mutex<Vec<Message>>,
    closed: AtomicBool,
}

impl RecordingClientLeg {
    pub fn new() -> Self {
        RecordingClientLeg::default()
    }

    /// Messages received since the last call
    pub fn take_messages(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// Concatenated payload of all byte messages received so far
    pub fn received_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for message in self.messages.lock().iter() {
            if let Message::Bytes(bytes) = message {
                buf.extend_from_slice(bytes);
            }
        }
        buf.freeze()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ClientLeg for RecordingClientLeg {
    fn write(&self, message: Message) {
        self.messages.lock().push(message);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
