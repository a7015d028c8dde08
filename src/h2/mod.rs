//! HTTP/2 on the backend leg
//!
//! The wire layer (`frames`, `codec`, `settings`, `flow_control`, `error`)
//! encodes and decodes RFC 7540 frames. [`UpstreamConnection`] keeps the
//! connection-scoped state toward the origin, and [`Http2StreamTranslator`]
//! is the protocol handler that bridges client-leg frames onto it while
//! renumbering streams through a [`StreamIdMap`].
//!
//! ```text
//!  client leg                     translator                    origin
//!  stream 7  ── HEADERS ──▶  upstream_id(7) = 1  ── HEADERS ──▶ stream 1
//!  stream 7  ◀── DATA ────   origin_id(1)  = 7   ◀── DATA ───── stream 1
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod settings;
pub mod stream_map;
pub mod translator;

pub use connection::{UpstreamConnection, UpstreamEvent, CONNECTION_PREFACE};
pub use error::{Error, ErrorCode, Result};
pub use frames::{header_list, FramePayload, HeaderList, PrioritySpec, StreamFrame};
pub use settings::{Settings, SettingsBuilder};
pub use stream_map::StreamIdMap;
pub use translator::Http2StreamTranslator;
