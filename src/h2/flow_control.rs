//! HTTP/2 flow control
//!
//! Implements RFC 7540 Section 5.2 for the upstream connection, in both
//! directions.
//!
//! Receive side: received DATA shrinks the advertised window immediately;
//! bytes only count as processed once the translator has handed them to
//! the client leg. A WINDOW_UPDATE is produced once the processed window of
//! the connection or of a stream drops below half its initial size.
//!
//! Send side: DATA toward the origin may only use what both the connection
//! window and the stream window allow. The origin grows them with
//! WINDOW_UPDATE and resizes stream windows with SETTINGS_INITIAL_WINDOW_SIZE.

use super::error::{Error, Result};
use super::frames::WindowUpdateFrame;
use super::settings::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};
use std::collections::HashMap;

/// Flow control window
///
/// Tracks what the peer may still send (`window`) separately from what has
/// been processed and not yet given back (`processed`).
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Initial window size
    initial_size: u32,
    /// Octets the peer may still send
    window: i64,
    /// Initial size minus octets processed but not yet returned
    processed: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            window: initial_size as i64,
            processed: initial_size as i64,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.window
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Account for `amount` octets received from the peer
    pub fn receive(&mut self, amount: usize) -> Result<()> {
        let amount = amount as i64;
        if amount > self.window {
            return Err(Error::FlowControl(format!(
                "peer sent {} octets with only {} left in the window",
                amount, self.window
            )));
        }
        self.window -= amount;
        Ok(())
    }

    /// Mark `amount` octets as processed.
    ///
    /// Returns the increment to announce when the processed window has
    /// fallen below half of the initial size.
    pub fn consume(&mut self, amount: usize) -> Option<u32> {
        self.processed -= amount as i64;

        let initial = self.initial_size as i64;
        if self.processed < initial / 2 {
            let increment = initial - self.processed;
            self.processed = initial;
            self.window = (self.window + increment).min(MAX_WINDOW_SIZE as i64);
            Some(increment as u32)
        } else {
            None
        }
    }

    /// Update initial window size from our own SETTINGS
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_window = self.window + diff;
        if new_window > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_window
            )));
        }

        self.initial_size = new_initial_size;
        self.window = new_window;
        self.processed += diff;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive windows for the connection and every open stream
#[derive(Debug)]
pub struct InboundFlowControl {
    /// Initial window for new streams (our SETTINGS_INITIAL_WINDOW_SIZE)
    stream_initial: u32,
    connection: FlowControlWindow,
    streams: HashMap<u32, FlowControlWindow>,
}

impl InboundFlowControl {
    /// The connection window always starts at 65535 (RFC 7540 Section 6.9.2)
    pub fn new(stream_initial: u32) -> Self {
        InboundFlowControl {
            stream_initial,
            connection: FlowControlWindow::new(),
            streams: HashMap::new(),
        }
    }

    pub fn connection_window(&self) -> &FlowControlWindow {
        &self.connection
    }

    pub fn stream_window(&self, stream_id: u32) -> Option<&FlowControlWindow> {
        self.streams.get(&stream_id)
    }

    /// Account for a received DATA frame of `len` flow-controlled octets
    pub fn on_data(&mut self, stream_id: u32, len: usize) -> Result<()> {
        self.connection.receive(len)?;
        let initial = self.stream_initial;
        self.streams
            .entry(stream_id)
            .or_insert_with(|| FlowControlWindow::with_initial_size(initial))
            .receive(len)
    }

    /// Mark `processed` octets of `stream_id` as handed off and collect the
    /// WINDOW_UPDATE frames that are now due
    pub fn consume(&mut self, stream_id: u32, processed: usize) -> Vec<WindowUpdateFrame> {
        let mut updates = Vec::new();
        if processed == 0 {
            return updates;
        }

        if let Some(increment) = self.connection.consume(processed) {
            updates.push(WindowUpdateFrame {
                stream_id: 0,
                size_increment: increment,
            });
        }
        if let Some(window) = self.streams.get_mut(&stream_id) {
            if let Some(increment) = window.consume(processed) {
                updates.push(WindowUpdateFrame {
                    stream_id,
                    size_increment: increment,
                });
            }
        }
        updates
    }

    /// Apply a new SETTINGS_INITIAL_WINDOW_SIZE to open and future streams
    pub fn update_initial_window(&mut self, initial: u32) -> Result<()> {
        for window in self.streams.values_mut() {
            window.update_initial_size(initial)?;
        }
        self.stream_initial = initial;
        Ok(())
    }

    /// Forget a stream the peer has finished sending on
    pub fn close_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }
}

/// Window granted by the origin for DATA we send
///
/// Can go negative when the origin shrinks SETTINGS_INITIAL_WINDOW_SIZE
/// below what is already in flight.
#[derive(Debug, Clone)]
pub struct SendWindow {
    initial_size: u32,
    current_size: i64,
}

impl SendWindow {
    pub fn with_initial_size(initial_size: u32) -> Self {
        SendWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Octets that may be sent right now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    pub fn consume(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Apply a WINDOW_UPDATE from the origin
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol(
                "Window update increment must be non-zero".to_string(),
            ));
        }

        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }
        self.current_size = new_size;
        Ok(new_size)
    }

    /// Update initial window size from the origin's SETTINGS
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_size = self.current_size + diff;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }
        self.initial_size = new_initial_size;
        self.current_size = new_size;
        Ok(())
    }
}

/// Send windows for the connection and every stream we are still sending on
#[derive(Debug)]
pub struct OutboundFlowControl {
    /// Initial window for new streams (the origin's SETTINGS_INITIAL_WINDOW_SIZE)
    stream_initial: u32,
    connection: SendWindow,
    streams: HashMap<u32, SendWindow>,
}

impl OutboundFlowControl {
    pub fn new(stream_initial: u32) -> Self {
        OutboundFlowControl {
            stream_initial,
            connection: SendWindow::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE),
            streams: HashMap::new(),
        }
    }

    pub fn connection_window(&self) -> &SendWindow {
        &self.connection
    }

    pub fn stream_window(&self, stream_id: u32) -> Option<&SendWindow> {
        self.streams.get(&stream_id)
    }

    /// Flow-controlled octets `stream_id` may send right now
    pub fn capacity(&self, stream_id: u32) -> usize {
        let stream = match self.streams.get(&stream_id) {
            Some(window) => window.available(),
            None => self.stream_initial as usize,
        };
        stream.min(self.connection.available())
    }

    /// Charge `amount` sent octets to the connection and to `stream_id`
    pub fn consume(&mut self, stream_id: u32, amount: usize) {
        if amount == 0 {
            return;
        }
        self.connection.consume(amount);
        let initial = self.stream_initial;
        self.streams
            .entry(stream_id)
            .or_insert_with(|| SendWindow::with_initial_size(initial))
            .consume(amount);
    }

    /// Credit a WINDOW_UPDATE; updates for streams we no longer send on
    /// are ignored
    pub fn increase(&mut self, stream_id: u32, increment: u32) -> Result<()> {
        if stream_id == 0 {
            self.connection.increase(increment)?;
        } else if let Some(window) = self.streams.get_mut(&stream_id) {
            window.increase(increment)?;
        } else if increment == 0 {
            return Err(Error::Protocol(format!(
                "zero WINDOW_UPDATE on stream {}",
                stream_id
            )));
        }
        Ok(())
    }

    /// Apply the origin's SETTINGS_INITIAL_WINDOW_SIZE to open and future
    /// streams; the connection window is not affected
    pub fn update_initial_window(&mut self, initial: u32) -> Result<()> {
        for window in self.streams.values_mut() {
            window.update_initial_size(initial)?;
        }
        self.stream_initial = initial;
        Ok(())
    }

    /// Forget a stream we will not send DATA on again
    pub fn close_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }
}
