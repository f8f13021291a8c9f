use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use vidlink_codec::{PixelFormat, RawFrame, resize};

use crate::transport::status::TransportStatus;

/// Pull side of the pipeline. `None` means the source is exhausted.
///
/// May block (a capture device waiting for its next frame); it is always called from a
/// blocking thread.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<RawFrame>;
}

impl<I> FrameSource for I
where
    I: Iterator<Item = RawFrame> + Send,
{
    fn next_frame(&mut self) -> Option<RawFrame> {
        self.next()
    }
}

/// Receives every decoded frame with its sequence number. Must return quickly.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: RawFrame, sequence: u64);
}

impl<F> FrameSink for F
where
    F: Fn(RawFrame, u64) + Send + Sync,
{
    fn on_frame(&self, frame: RawFrame, sequence: u64) {
        self(frame, sequence)
    }
}

pub trait StatusListener: Send + Sync {
    fn on_status(&self, status: &TransportStatus);
}

impl<F> StatusListener for F
where
    F: Fn(&TransportStatus) + Send + Sync,
{
    fn on_status(&self, status: &TransportStatus) {
        self(status)
    }
}

/// Rescales every frame to a fixed size so the encoder, sized by the first frame,
/// never sees another resolution.
pub struct NormalizingSource {
    inner: Box<dyn FrameSource>,
    width: u32,
    height: u32,
}

impl NormalizingSource {
    pub fn new(inner: Box<dyn FrameSource>, width: u32, height: u32) -> Self {
        Self {
            inner,
            width,
            height,
        }
    }
}

impl FrameSource for NormalizingSource {
    fn next_frame(&mut self) -> Option<RawFrame> {
        loop {
            let frame = self.inner.next_frame()?;
            if frame.same_size(self.width, self.height) {
                return Some(frame);
            }
            match resize(&frame, self.width, self.height) {
                Ok(resized) => return Some(resized),
                Err(e) => log::warn!(
                    "dropping frame {}, cannot resize to {}x{}: {}",
                    frame.sequence(),
                    self.width,
                    self.height,
                    e
                ),
            }
        }
    }
}

/// Synthetic moving gradient, paced at `fps`.
pub struct TestPattern {
    width: u32,
    height: u32,
    interval: Duration,
    limit: Option<u64>,
    sequence: u64,
    next_due: Option<Instant>,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            interval: Duration::from_secs(1) / fps.max(1),
            limit: None,
            sequence: 0,
            next_due: None,
        }
    }

    /// Stops after `frames` frames instead of running forever.
    pub fn limited(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Emits frames as fast as they are pulled.
    pub fn unpaced(mut self) -> Self {
        self.interval = Duration::ZERO;
        self
    }

    fn render(&self) -> Option<RawFrame> {
        let shift = (self.sequence as u32).wrapping_mul(4);
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push((x.wrapping_add(shift) % 256) as u8);
                data.push((y.wrapping_add(shift) % 256) as u8);
                data.push(((x + y) % 256) as u8);
            }
        }
        match RawFrame::packed(self.width, self.height, PixelFormat::Rgb24, data, self.sequence) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::error!("test pattern: {}", e);
                None
            }
        }
    }
}

impl Iterator for TestPattern {
    type Item = RawFrame;

    fn next(&mut self) -> Option<RawFrame> {
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return None;
        }
        if !self.interval.is_zero() {
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                std::thread::sleep(due - now);
            }
            self.next_due = Some(due.max(now) + self.interval);
        }
        let frame = self.render()?;
        self.sequence += 1;
        Some(frame)
    }
}

/// Logs one line every `every` frames.
pub struct LogSink {
    every: u64,
    received: AtomicU64,
}

impl LogSink {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            received: AtomicU64::new(0),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl FrameSink for LogSink {
    fn on_frame(&self, frame: RawFrame, sequence: u64) {
        let received = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        if received % self.every == 1 {
            log::info!(
                "received frame {} ({}x{}), {} total",
                sequence,
                frame.width(),
                frame.height(),
                received
            );
        }
    }
}

pub struct LogStatus;

impl StatusListener for LogStatus {
    fn on_status(&self, status: &TransportStatus) {
        log::info!("status: {}", status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_limited_and_unpaced() {
        let frames: Vec<RawFrame> = TestPattern::new(16, 8, 30).unpaced().limited(3).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].sequence(), 2);
        assert_eq!((frames[0].width(), frames[0].height()), (16, 8));
        assert_ne!(frames[0].data(), frames[1].data());
    }

    #[test]
    fn test_pattern_paces_frames() {
        let start = Instant::now();
        let frames: Vec<RawFrame> = TestPattern::new(8, 8, 50).limited(4).collect();
        assert_eq!(frames.len(), 4);
        // first frame is immediate, then three 20ms intervals
        assert!(start.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn normalizing_source_resizes_mismatched_frames() {
        vidlink_codec::init().unwrap();
        let mixed = vec![
            RawFrame::packed(32, 16, PixelFormat::Rgb24, vec![0u8; 32 * 16 * 3], 0).unwrap(),
            RawFrame::packed(64, 32, PixelFormat::Rgb24, vec![0u8; 64 * 32 * 3], 1).unwrap(),
        ];
        let mut source = NormalizingSource::new(Box::new(mixed.into_iter()), 32, 16);
        let first = source.next_frame().unwrap();
        let second = source.next_frame().unwrap();
        assert!(first.same_size(32, 16));
        assert!(second.same_size(32, 16));
        assert_eq!(second.sequence(), 1);
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn closures_are_sinks_and_listeners() {
        let count = AtomicU64::new(0);
        let sink = |_: RawFrame, seq: u64| {
            count.fetch_add(seq, Ordering::Relaxed);
        };
        let frame = RawFrame::packed(2, 2, PixelFormat::Gray8, vec![0u8; 4], 5).unwrap();
        sink.on_frame(frame, 5);
        assert_eq!(count.load(Ordering::Relaxed), 5);

        let seen = std::sync::Mutex::new(Vec::new());
        let listener = |s: &TransportStatus| seen.lock().unwrap().push(s.to_string());
        listener.on_status(&TransportStatus::Connected);
        assert_eq!(seen.lock().unwrap().as_slice(), ["connected"]);
    }
}
