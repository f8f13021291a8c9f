//! Duplex packet streaming over one connection at a time.
//!
//! Each attempt runs three units: the producer pulls frames from the source on a blocking
//! thread, the sender encodes and writes, the receiver reads and decodes. The first unit to
//! end trips the attempt's stop token; an error in any unit fails the attempt and sends the
//! transport down the reconnect path.

pub mod connection;
pub mod retry;
pub mod status;
pub mod ws;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{
    sync::Mutex as AsyncMutex,
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use vidlink_codec::{CodecError, EncodedPacket, MediaCodec, RawFrame};

use crate::{
    config::StreamConfig,
    error::TransportError,
    io::{FrameSink, FrameSource, StatusListener},
    queue::{BoundedFrameQueue, QueueCmd, DEFAULT_QUEUE_CAPACITY},
};
use connection::{Connector, Incoming, PacketReader, PacketWriter};
use retry::{RetryPolicy, TransportAttempt};
use status::TransportStatus;

pub type SharedCodec<C> = Arc<Mutex<C>>;
pub type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;
type SharedWriter = Arc<AsyncMutex<Box<dyn PacketWriter>>>;

const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub fps: u32,
    pub queue_capacity: usize,
    /// Upper bound on any wait before the stop token is checked again.
    pub poll_interval: Duration,
    pub heartbeat: Duration,
    pub grace_period: Duration,
    pub retry: RetryPolicy,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: Duration::from_millis(200),
            heartbeat: Duration::from_secs(10),
            grace_period: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl TransportSettings {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            fps: config.fps,
            queue_capacity: config.queue_capacity,
            poll_interval: config.poll_interval(),
            heartbeat: config.heartbeat(),
            grace_period: config.grace_period(),
            retry: config.retry_policy(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Producer,
    Sender,
    Receiver,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Producer => write!(f, "producer"),
            Unit::Sender => write!(f, "sender"),
            Unit::Receiver => write!(f, "receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitExit {
    Completed,
    Stopped,
}

type UnitResult = (Unit, Result<UnitExit, TransportError>);

pub struct StreamTransport<C> {
    connector: Arc<dyn Connector>,
    codec: SharedCodec<C>,
    source: SharedSource,
    sink: Arc<dyn FrameSink>,
    status: Option<Arc<dyn StatusListener>>,
    settings: TransportSettings,
    cancel: CancellationToken,
}

impl<C: MediaCodec + 'static> StreamTransport<C> {
    pub fn new(
        connector: Arc<dyn Connector>,
        codec: SharedCodec<C>,
        source: SharedSource,
        sink: Arc<dyn FrameSink>,
        settings: TransportSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            codec,
            source,
            sink,
            status: None,
            settings,
            cancel,
        }
    }

    pub fn with_status(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.status = Some(listener);
        self
    }

    pub fn codec(&self) -> &SharedCodec<C> {
        &self.codec
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn notify(&self, status: TransportStatus) {
        if let Some(listener) = &self.status {
            listener.on_status(&status);
        }
    }

    /// Runs attempts until the source is exhausted, the token is cancelled, or the retry
    /// policy gives up with [`TransportError::Exhausted`].
    pub async fn run(&self) -> Result<(), TransportError> {
        let mut attempt = TransportAttempt::new(self.settings.retry.clone());
        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            self.notify(TransportStatus::Connecting {
                attempt: attempt.count() + 1,
            });

            let (progressed, outcome) = self.run_attempt().await;
            if progressed {
                attempt.reset();
            }
            let error = match outcome {
                Ok(()) => break Ok(()),
                Err(e) => e,
            };
            if self.cancel.is_cancelled() {
                log::debug!("attempt ended during shutdown: {}", error);
                break Ok(());
            }
            if !error.is_retryable() {
                log::error!("transport failed: {}", error);
                break Err(error);
            }

            match attempt.record_failure() {
                Some(delay) => {
                    log::warn!(
                        "connection attempt {} failed: {}, retrying in {:.1}s",
                        attempt.count(),
                        error,
                        delay.as_secs_f64()
                    );
                    self.notify(TransportStatus::Retrying {
                        attempt: attempt.count(),
                        delay,
                    });
                    tokio::select! {
                        _ = self.cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    log::error!(
                        "giving up after {} failed attempts: {}",
                        attempt.count(),
                        error
                    );
                    break Err(TransportError::Exhausted {
                        attempts: attempt.count(),
                        last_error: error.to_string(),
                    });
                }
            }
        };
        self.notify(TransportStatus::Disconnected);
        result
    }

    /// Returns whether any packet moved during the attempt, plus its outcome.
    async fn run_attempt(&self) -> (bool, Result<(), TransportError>) {
        let progressed = Arc::new(AtomicBool::new(false));
        let outcome = self.attempt(&progressed).await;
        // compressed-stream state never outlives its connection
        close_codec(&self.codec).await;
        (progressed.load(Ordering::Acquire), outcome)
    }

    async fn attempt(&self, progressed: &Arc<AtomicBool>) -> Result<(), TransportError> {
        let (writer, reader) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            connection = self.connector.connect() => connection?,
        };
        log::info!("connection established");
        self.notify(TransportStatus::Connected);

        let writer: SharedWriter = Arc::new(AsyncMutex::new(writer));
        let outcome = self.stream(&writer, reader, progressed).await;
        self.close_connection(&writer).await;
        outcome
    }

    async fn stream(
        &self,
        writer: &SharedWriter,
        reader: Box<dyn PacketReader>,
        progressed: &Arc<AtomicBool>,
    ) -> Result<(), TransportError> {
        with_codec(&self.codec, |codec| codec.init_decoder()).await??;

        let stop = self.cancel.child_token();
        let outbound = Arc::new(BoundedFrameQueue::new(self.settings.queue_capacity));
        let mut units: JoinSet<UnitResult> = JoinSet::new();

        {
            let source = self.source.clone();
            let queue = outbound.clone();
            let stop = stop.clone();
            units.spawn_blocking(move || (Unit::Producer, produce(&source, &queue, &stop)));
        }
        {
            let sender = Sender {
                codec: self.codec.clone(),
                queue: outbound.clone(),
                writer: writer.clone(),
                stop: stop.clone(),
                progressed: progressed.clone(),
                fps: self.settings.fps,
                poll_interval: self.settings.poll_interval,
                heartbeat: self.settings.heartbeat.max(MIN_HEARTBEAT),
            };
            units.spawn(async move { (Unit::Sender, sender.run().await) });
        }
        {
            let receiver = Receiver {
                codec: self.codec.clone(),
                reader,
                sink: self.sink.clone(),
                stop: stop.clone(),
                progressed: progressed.clone(),
                poll_interval: self.settings.poll_interval,
            };
            units.spawn(async move { (Unit::Receiver, receiver.run().await) });
        }

        let mut failure = None;
        while let Some(joined) = units.join_next().await {
            match joined {
                // the sender still has to drain the queue and flush the encoder
                Ok((Unit::Producer, Ok(UnitExit::Completed))) => {
                    log::debug!("frame source exhausted");
                }
                Ok((unit, Ok(exit))) => {
                    log::info!("{} finished ({:?}), stopping attempt", unit, exit);
                    break;
                }
                Ok((unit, Err(e))) => {
                    log::warn!("{} failed: {}", unit, e);
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    log::error!("unit task failed: {}", e);
                    failure = Some(e.into());
                    break;
                }
            }
        }

        stop.cancel();
        let grace = self.settings.grace_period;
        let drained = tokio::time::timeout(grace, async {
            let mut late = None;
            while let Some(joined) = units.join_next().await {
                match joined {
                    Ok((unit, Err(e))) => {
                        log::debug!("{} failed while stopping: {}", unit, e);
                        late.get_or_insert(e);
                    }
                    Err(e) if !e.is_cancelled() => {
                        late.get_or_insert(e.into());
                    }
                    _ => {}
                }
            }
            late
        })
        .await;
        match drained {
            Ok(late) => {
                if failure.is_none() {
                    failure = late;
                }
            }
            Err(_) => {
                log::warn!("units still running after {:?}, aborting", grace);
                units.abort_all();
            }
        }

        failure.map_or(Ok(()), Err)
    }

    async fn close_connection(&self, writer: &SharedWriter) {
        let grace = self.settings.grace_period;
        match tokio::time::timeout(grace, async { writer.lock().await.close().await }).await {
            Ok(Ok(())) => log::debug!("connection closed"),
            Ok(Err(e)) => log::debug!("error closing connection: {}", e),
            Err(_) => log::debug!("closing connection timed out"),
        }
    }
}

fn produce(
    source: &SharedSource,
    queue: &BoundedFrameQueue<RawFrame>,
    stop: &CancellationToken,
) -> Result<UnitExit, TransportError> {
    let mut produced = 0u64;
    let exit = loop {
        if stop.is_cancelled() {
            break UnitExit::Stopped;
        }
        let next = lock(source).next_frame();
        let Some(frame) = next else {
            break UnitExit::Completed;
        };
        produced += 1;
        if let Some(evicted) = queue.put(frame) {
            log::trace!("outbound queue full, evicted frame {}", evicted.sequence());
        }
    };
    // the sender must never wait on a producer that is gone
    queue.put_eof();
    log::debug!("producer exiting after {} frames ({:?})", produced, exit);
    Ok(exit)
}

struct Sender<C> {
    codec: SharedCodec<C>,
    queue: Arc<BoundedFrameQueue<RawFrame>>,
    writer: SharedWriter,
    stop: CancellationToken,
    progressed: Arc<AtomicBool>,
    fps: u32,
    poll_interval: Duration,
    heartbeat: Duration,
}

impl<C: MediaCodec + 'static> Sender<C> {
    async fn run(self) -> Result<UnitExit, TransportError> {
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0u64;
        loop {
            let cmd = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(UnitExit::Stopped),
                _ = heartbeat.tick() => {
                    self.writer.lock().await.ping().await?;
                    continue;
                }
                cmd = self.queue.get(self.poll_interval) => cmd,
            };
            match cmd {
                None => continue,
                Some(QueueCmd::Data(frame)) => {
                    let fps = self.fps;
                    let packets = with_codec(
                        &self.codec,
                        move |codec: &mut C| -> Result<Vec<EncodedPacket>, CodecError> {
                            // sized by the first frame of the attempt
                            if !codec.encoder_initialized() {
                                codec.init_encoder(frame.width(), frame.height(), fps)?;
                            }
                            codec.encode(&frame)
                        },
                    )
                    .await??;
                    sent += self.write(packets).await?;
                }
                Some(QueueCmd::Eof) => {
                    let packets = with_codec(&self.codec, |codec| codec.flush_encoder()).await?;
                    sent += self.write(packets).await?;
                    log::debug!("sender drained after {} packets", sent);
                    return Ok(UnitExit::Completed);
                }
            }
        }
    }

    async fn write(&self, packets: Vec<EncodedPacket>) -> Result<u64, TransportError> {
        if packets.is_empty() {
            return Ok(0);
        }
        let count = packets.len() as u64;
        let mut writer = self.writer.lock().await;
        for packet in packets {
            writer.send(packet.into_data()).await?;
        }
        self.progressed.store(true, Ordering::Release);
        Ok(count)
    }
}

struct Receiver<C> {
    codec: SharedCodec<C>,
    reader: Box<dyn PacketReader>,
    sink: Arc<dyn FrameSink>,
    stop: CancellationToken,
    progressed: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl<C: MediaCodec + 'static> Receiver<C> {
    async fn run(mut self) -> Result<UnitExit, TransportError> {
        let mut delivered = 0u64;
        loop {
            let incoming = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(UnitExit::Stopped),
                incoming = self.reader.recv(self.poll_interval) => incoming,
            };
            match incoming {
                Ok(Incoming::Packet(data)) => {
                    self.progressed.store(true, Ordering::Release);
                    let frames = with_codec(&self.codec, move |codec| codec.decode(&data)).await?;
                    for frame in frames {
                        let sequence = frame.sequence();
                        self.sink.on_frame(frame, sequence);
                        delivered += 1;
                    }
                }
                Ok(Incoming::Idle) => {}
                Ok(Incoming::Closed) | Err(_) if self.stop.is_cancelled() => {
                    return Ok(UnitExit::Stopped);
                }
                Ok(Incoming::Closed) => {
                    log::info!("peer closed the connection after {} frames", delivered);
                    return Err(TransportError::Closed);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `f` against the codec on the blocking pool so encode and decode never stall the
/// runtime driving network I/O.
pub(crate) async fn with_codec<C, R, F>(codec: &SharedCodec<C>, f: F) -> Result<R, TransportError>
where
    C: MediaCodec + 'static,
    R: Send + 'static,
    F: FnOnce(&mut C) -> R + Send + 'static,
{
    let codec = Arc::clone(codec);
    let result = tokio::task::spawn_blocking(move || {
        let mut guard = lock(&codec);
        f(&mut *guard)
    })
    .await?;
    Ok(result)
}

pub(crate) async fn close_codec<C: MediaCodec + 'static>(codec: &SharedCodec<C>) {
    if let Err(e) = with_codec(codec, |codec| codec.close()).await {
        log::warn!("closing codec off the runtime failed ({}), closing inline", e);
        lock(codec).close();
    }
}
