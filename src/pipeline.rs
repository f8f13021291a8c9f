use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use vidlink_codec::{CodecSession, MediaCodec, RawFrame};

use crate::{
    config::StreamConfig,
    error::TransportError,
    io::{FrameSink, FrameSource, NormalizingSource, StatusListener},
    queue::{BoundedFrameQueue, QueueCmd},
    transport::{
        close_codec, connection::Connector, lock, status::TransportStatus, ws::WsConnector,
        SharedCodec, SharedSource, StreamTransport, TransportSettings,
    },
};

type RunResult = Option<Result<(), TransportError>>;

/// Wires a frame source and sink to a [`StreamTransport`] and owns its lifecycle.
///
/// Decoded frames go through a bounded queue to a delivery task, so a slow sink drops old
/// frames instead of stalling the receiver.
pub struct Pipeline<C = CodecSession> {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    codec: SharedCodec<C>,
    source: SharedSource,
    sink: Arc<dyn FrameSink>,
    listener: Option<Arc<dyn StatusListener>>,
    status: Arc<Mutex<TransportStatus>>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    done: Arc<watch::Sender<RunResult>>,
}

impl Pipeline<CodecSession> {
    /// Streams over WebSocket to `config.endpoint` with an FFmpeg-backed codec.
    pub fn new(
        config: StreamConfig,
        source: impl FrameSource + 'static,
        sink: impl FrameSink + 'static,
    ) -> Self {
        let connector = Arc::new(WsConnector::from_config(&config));
        let codec = CodecSession::new(config.encoder_settings())
            .with_error_threshold(config.decode_error_threshold);
        Self::with_parts(config, connector, codec, Box::new(source), Arc::new(sink))
    }
}

impl<C: MediaCodec + 'static> Pipeline<C> {
    pub fn with_parts(
        config: StreamConfig,
        connector: Arc<dyn Connector>,
        codec: C,
        source: Box<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let source: Box<dyn FrameSource> = match config.target_size() {
            Some((width, height)) => Box::new(NormalizingSource::new(source, width, height)),
            None => source,
        };
        let (done, _) = watch::channel(None);
        Self {
            config,
            connector,
            codec: Arc::new(Mutex::new(codec)),
            source: Arc::new(Mutex::new(source)),
            sink,
            listener: None,
            status: Arc::new(Mutex::new(TransportStatus::Idle)),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            done: Arc::new(done),
        }
    }

    pub fn with_status(mut self, listener: impl StatusListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Spawns the transport and the delivery task. Returns `false` if already started.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            log::warn!("Pipeline: already started");
            return false;
        }
        if self.cancel.is_cancelled() {
            log::warn!("Pipeline: start after stop ignored");
            self.done.send_replace(Some(Ok(())));
            return false;
        }

        let delivery = Arc::new(BoundedFrameQueue::new(self.config.queue_capacity));
        let recorder = StatusRecorder {
            last: self.status.clone(),
            inner: self.listener.clone(),
        };
        let transport = StreamTransport::new(
            self.connector.clone(),
            self.codec.clone(),
            self.source.clone(),
            Arc::new(QueueSink(delivery.clone())),
            TransportSettings::from_config(&self.config),
            self.cancel.clone(),
        )
        .with_status(Arc::new(recorder));

        let run = {
            let done = self.done.clone();
            let delivery = delivery.clone();
            tokio::spawn(async move {
                let result = transport.run().await;
                if let Err(e) = &result {
                    log::error!("Pipeline: transport stopped: {}", e);
                }
                delivery.put_eof();
                done.send_replace(Some(result));
            })
        };
        let deliver = {
            let sink = self.sink.clone();
            let cancel = self.cancel.clone();
            let poll_interval = self.config.poll_interval();
            tokio::spawn(async move {
                deliver(&delivery, sink.as_ref(), &cancel, poll_interval).await;
            })
        };
        lock(&self.tasks).extend([run, deliver]);
        log::info!("Pipeline: started, streaming to {}", self.config.endpoint);
        true
    }

    /// Waits for the transport to finish. Surfaces [`TransportError::Exhausted`] when the
    /// retry policy gave up.
    pub async fn join(&self) -> Result<(), TransportError> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut done = self.done.subscribe();
        let finished = done.wait_for(Option::is_some).await;
        match finished {
            Ok(result) => (*result).clone().unwrap_or(Ok(())),
            Err(_) => Err(TransportError::Task("pipeline run task dropped".to_string())),
        }
    }

    /// Cancels the transport and waits for it. Safe to call at any time, more than once.
    /// The codec and the connection are released before this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if self.started.load(Ordering::Acquire) {
            // attempt teardown waits one grace period for the units and one for the close
            let budget = self.config.grace_period() * 3;
            if tokio::time::timeout(budget, self.join()).await.is_err() {
                log::warn!("Pipeline: still running after {:?}, aborting", budget);
                let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
                for task in &tasks {
                    task.abort();
                }
                // an aborted task releases its connection only once its handle resolves
                for task in tasks {
                    let _ = task.await;
                }
                self.done.send_if_modified(|done| {
                    if done.is_none() {
                        *done = Some(Ok(()));
                        true
                    } else {
                        false
                    }
                });
                *lock(&self.status) = TransportStatus::Disconnected;
            }
        }
        close_codec(&self.codec).await;
        log::info!("Pipeline: stopped");
    }

    pub fn status(&self) -> TransportStatus {
        lock(&self.status).clone()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && self.done.borrow().is_none()
    }

    /// The shared codec, for inspection.
    pub fn codec(&self) -> &SharedCodec<C> {
        &self.codec
    }
}

impl<C> Drop for Pipeline<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn deliver(
    queue: &BoundedFrameQueue<RawFrame>,
    sink: &dyn FrameSink,
    cancel: &CancellationToken,
    poll_interval: Duration,
) {
    let mut delivered = 0u64;
    loop {
        match queue.get(poll_interval).await {
            Some(QueueCmd::Data(frame)) => {
                let sequence = frame.sequence();
                sink.on_frame(frame, sequence);
                delivered += 1;
            }
            Some(QueueCmd::Eof) => break,
            None if cancel.is_cancelled() => break,
            None => {}
        }
    }
    log::debug!(
        "Pipeline: delivered {} frames, {} dropped",
        delivered,
        queue.dropped()
    );
}

struct QueueSink(Arc<BoundedFrameQueue<RawFrame>>);

impl FrameSink for QueueSink {
    fn on_frame(&self, frame: RawFrame, _sequence: u64) {
        if let Some(evicted) = self.0.put(frame) {
            log::trace!("delivery queue full, evicted frame {}", evicted.sequence());
        }
    }
}

struct StatusRecorder {
    last: Arc<Mutex<TransportStatus>>,
    inner: Option<Arc<dyn StatusListener>>,
}

impl StatusListener for StatusRecorder {
    fn on_status(&self, status: &TransportStatus) {
        *lock(&self.last) = status.clone();
        if let Some(inner) = &self.inner {
            inner.on_status(status);
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
