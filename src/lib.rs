//! Real-time bidirectional video transport.
//!
//! Frames pulled from a [`io::FrameSource`] are encoded to H.264, streamed over a
//! persistent WebSocket, and the packets coming back are decoded and handed to an
//! [`io::FrameSink`]. [`pipeline::Pipeline`] is the entry point.

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod queue;
pub mod relay;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use vidlink_codec as codec;

pub use config::StreamConfig;
pub use error::{ConfigError, TransportError};
pub use pipeline::Pipeline;
pub use queue::{BoundedFrameQueue, QueueCmd};
pub use transport::{status::TransportStatus, StreamTransport};
