//! In-memory connection and codec doubles for the transport and pipeline tests.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use vidlink_codec::{CodecError, EncodedPacket, MediaCodec, PixelFormat, RawFrame};

use crate::{
    error::TransportError,
    io::{FrameSink, StatusListener},
    transport::{
        connection::{Connection, Connector, Incoming, PacketReader, PacketWriter},
        status::TransportStatus,
    },
};

pub fn frame(sequence: u64, width: u32, height: u32) -> RawFrame {
    let len = (width * height) as usize;
    RawFrame::packed(width, height, PixelFormat::Gray8, vec![0x80u8; len], sequence).unwrap()
}

pub fn tiny_frame(sequence: u64) -> RawFrame {
    frame(sequence, 2, 2)
}

/// Endless source, one frame per `interval`.
pub fn paced_frames(interval: Duration) -> impl Iterator<Item = RawFrame> + Send + 'static {
    (0u64..).map(move |sequence| {
        std::thread::sleep(interval);
        tiny_frame(sequence)
    })
}

/// Encodes a frame as its big-endian sequence number and decodes that back, so tests can
/// follow individual frames across the loopback.
#[derive(Debug, Default)]
pub struct PassthroughCodec {
    decoder: bool,
    encoder: Option<(u32, u32)>,
    pub fail_decoder_init: bool,
    /// Blocks `init_decoder` on the calling thread.
    pub init_delay: Option<Duration>,
    pub reject_frames: bool,
    pub encoder_sizes: Vec<(u32, u32)>,
    pub closes: usize,
}

impl MediaCodec for PassthroughCodec {
    fn init_decoder(&mut self) -> Result<(), CodecError> {
        if let Some(delay) = self.init_delay {
            std::thread::sleep(delay);
        }
        if self.fail_decoder_init {
            return Err(CodecError::Init("decoder unavailable".to_string()));
        }
        self.decoder = true;
        Ok(())
    }

    fn init_encoder(&mut self, width: u32, height: u32, _fps: u32) -> Result<(), CodecError> {
        self.encoder = Some((width, height));
        self.encoder_sizes.push((width, height));
        Ok(())
    }

    fn encoder_initialized(&self) -> bool {
        self.encoder.is_some()
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<EncodedPacket>, CodecError> {
        if self.reject_frames || self.encoder.is_none() {
            return Err(CodecError::EncoderNotReady);
        }
        let payload = Bytes::copy_from_slice(&frame.sequence().to_be_bytes());
        Ok(vec![EncodedPacket::new(payload, frame.sequence() as i64)])
    }

    fn decode(&mut self, data: &[u8]) -> Vec<RawFrame> {
        if !self.decoder {
            return Vec::new();
        }
        match <[u8; 8]>::try_from(data) {
            Ok(bytes) => vec![tiny_frame(u64::from_be_bytes(bytes))],
            Err(_) => Vec::new(),
        }
    }

    fn flush_encoder(&mut self) -> Vec<EncodedPacket> {
        Vec::new()
    }

    fn flush_decoder(&mut self) -> Vec<RawFrame> {
        Vec::new()
    }

    fn close(&mut self) {
        if !self.is_closed() {
            self.closes += 1;
        }
        self.decoder = false;
        self.encoder = None;
    }

    fn is_closed(&self) -> bool {
        !self.decoder && self.encoder.is_none()
    }
}

/// Every connection echoes its writer into its own reader.
#[derive(Debug, Default)]
pub struct LoopbackConnector {
    attempts: AtomicU32,
    refuse_first: u32,
    drop_first_after: Option<usize>,
    closes: Arc<AtomicU32>,
    open: Arc<AtomicU32>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            refuse_first: u32::MAX,
            ..Self::default()
        }
    }

    /// The first connection reports a peer close after `packets` echoed packets.
    pub fn dropping_first_after(packets: usize) -> Self {
        Self {
            drop_first_after: Some(packets),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Explicit `close` calls across all connections.
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Writers handed out and not yet dropped.
    pub fn open_connections(&self) -> u32 {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.refuse_first {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let remaining = if attempt == 1 {
            self.drop_first_after
        } else {
            None
        };
        self.open.fetch_add(1, Ordering::SeqCst);
        let writer = ChannelWriter {
            tx: Some(tx),
            closes: self.closes.clone(),
            open: self.open.clone(),
        };
        Ok((Box::new(writer), Box::new(ChannelReader { rx, remaining })))
    }
}

struct ChannelWriter {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    closes: Arc<AtomicU32>,
    open: Arc<AtomicU32>,
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PacketWriter for ChannelWriter {
    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::Io("writer closed".to_string()))?;
        tx.send(payload)
            .map_err(|_| TransportError::Io("loopback reader gone".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.tx = None;
        Ok(())
    }
}

struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    remaining: Option<usize>,
}

#[async_trait]
impl PacketReader for ChannelReader {
    async fn recv(&mut self, wait: Duration) -> Result<Incoming, TransportError> {
        if self.remaining == Some(0) {
            return Ok(Incoming::Closed);
        }
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Err(_) => Ok(Incoming::Idle),
            Ok(None) => Ok(Incoming::Closed),
            Ok(Some(payload)) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                Ok(Incoming::Packet(payload))
            }
        }
    }
}

/// Sink that forwards sequence numbers to a channel.
pub fn channel_sink() -> (Arc<dyn FrameSink>, mpsc::UnboundedReceiver<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = move |_frame: RawFrame, sequence: u64| {
        let _ = tx.send(sequence);
    };
    let sink: Arc<dyn FrameSink> = Arc::new(sink);
    (sink, rx)
}

pub fn status_recorder() -> (Arc<dyn StatusListener>, Arc<Mutex<Vec<TransportStatus>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = {
        let seen = seen.clone();
        move |status: &TransportStatus| seen.lock().unwrap().push(status.clone())
    };
    let listener: Arc<dyn StatusListener> = Arc::new(listener);
    (listener, seen)
}

/// Collects `count` sequence numbers, giving up after `deadline`.
pub async fn collect(
    rx: &mut mpsc::UnboundedReceiver<u64>,
    count: usize,
    deadline: Duration,
) -> Vec<u64> {
    let mut seen = Vec::with_capacity(count);
    let _ = tokio::time::timeout(deadline, async {
        while seen.len() < count {
            match rx.recv().await {
                Some(sequence) => seen.push(sequence),
                None => break,
            }
        }
    })
    .await;
    seen
}
