//! Split halves of one duplex packet connection.
//!
//! The sender owns the writer and the receiver owns the reader, so each direction is
//! driven by exactly one task.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

pub type Connection = (Box<dyn PacketWriter>, Box<dyn PacketReader>);

/// Opens a fresh connection per attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;
}

#[async_trait]
pub trait PacketWriter: Send {
    /// Writes one message. The payload is carried as-is, message boundaries are the framing.
    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Keep-alive probe.
    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Packet(Bytes),
    /// Nothing arrived within the wait, or only control traffic did.
    Idle,
    Closed,
}

#[async_trait]
pub trait PacketReader: Send {
    /// Waits at most `wait` for the next message.
    async fn recv(&mut self, wait: Duration) -> Result<Incoming, TransportError>;
}
