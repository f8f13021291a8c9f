use crate::{
    decoder::Decoder,
    encoder::{Encoder, EncoderSettings},
    error::CodecError,
    frame::{PixelFormat, RawFrame},
    packet::EncodedPacket,
};

/// Consecutive corrupt units tolerated before the decoder is rebuilt.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Anything shorter cannot hold a start code plus a NAL header.
pub const MIN_UNIT_SIZE: usize = 4;

/// Encode/decode capability driven by the transport.
///
/// Implementations are used from one task at a time and need no internal locking.
pub trait MediaCodec: Send {
    fn init_decoder(&mut self) -> Result<(), CodecError>;

    fn init_encoder(&mut self, width: u32, height: u32, fps: u32) -> Result<(), CodecError>;

    fn encoder_initialized(&self) -> bool;

    /// Zero or more packets per frame; callers must not assume 1:1.
    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<EncodedPacket>, CodecError>;

    /// Never fails: corrupt input is absorbed and yields no frames.
    fn decode(&mut self, data: &[u8]) -> Vec<RawFrame>;

    fn flush_encoder(&mut self) -> Vec<EncodedPacket>;

    fn flush_decoder(&mut self) -> Vec<RawFrame>;

    /// Flushes and releases both halves. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// One decoder and one encoder for a streaming session, with corrupt-input recovery
/// on the decode path.
///
/// Decode state machine: a corrupt unit bumps `consecutive_decode_errors`; below the
/// threshold the decoder is flushed to resynchronize, at the threshold it is rebuilt.
/// Any successful decode clears the counter.
pub struct CodecSession {
    settings: EncoderSettings,
    output_format: PixelFormat,
    decoder: Option<Decoder>,
    encoder: Option<Encoder>,
    encoder_initialized: bool,
    consecutive_decode_errors: u32,
    max_consecutive_errors: u32,
    decoder_resets: u64,
    decoded_frames: u64,
}

impl CodecSession {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings,
            output_format: PixelFormat::Rgb24,
            decoder: None,
            encoder: None,
            encoder_initialized: false,
            consecutive_decode_errors: 0,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            decoder_resets: 0,
            decoded_frames: 0,
        }
    }

    pub fn with_output_format(mut self, format: PixelFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.max_consecutive_errors = threshold.max(1);
        self
    }

    pub fn consecutive_decode_errors(&self) -> u32 {
        self.consecutive_decode_errors
    }

    pub fn error_threshold(&self) -> u32 {
        self.max_consecutive_errors
    }

    /// Reinitializations triggered by the error threshold.
    pub fn decoder_resets(&self) -> u64 {
        self.decoder_resets
    }

    pub fn decoded_frames(&self) -> u64 {
        self.decoded_frames
    }

    pub fn has_decoder(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn has_encoder(&self) -> bool {
        self.encoder.is_some()
    }

    fn decode_unit(&mut self, data: &[u8]) -> Result<Vec<RawFrame>, CodecError> {
        if data.len() < MIN_UNIT_SIZE {
            return Err(CodecError::CorruptUnit(format!(
                "packet too small ({} bytes)",
                data.len()
            )));
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(Vec::new());
        };

        decoder
            .send_packet(data)
            .map_err(|e| CodecError::CorruptUnit(e.to_string()))?;
        let mut pictures = Vec::new();
        while let Some(picture) = decoder
            .receive_frame()
            .map_err(|e| CodecError::CorruptUnit(e.to_string()))?
        {
            pictures.push(picture);
        }
        Ok(self.pack(pictures))
    }

    fn pack(&mut self, pictures: Vec<ffmpeg_next::frame::Video>) -> Vec<RawFrame> {
        let mut frames = Vec::with_capacity(pictures.len());
        for picture in pictures {
            if picture.width() == 0 || picture.height() == 0 {
                log::warn!(
                    "invalid frame dimensions: {}x{}",
                    picture.width(),
                    picture.height()
                );
                continue;
            }
            let Some(decoder) = self.decoder.as_mut() else {
                break;
            };
            match decoder.to_raw(&picture, self.decoded_frames) {
                Ok(frame) => {
                    self.decoded_frames += 1;
                    log::debug!(
                        "decoded frame {}: {}x{}",
                        self.decoded_frames,
                        frame.width(),
                        frame.height()
                    );
                    frames.push(frame);
                }
                Err(e) => log::warn!("error converting decoded frame: {}", e),
            }
        }
        frames
    }

    fn on_corrupt_unit(&mut self, reason: &str, fed_decoder: bool) {
        self.consecutive_decode_errors += 1;
        log::warn!(
            "broken unit detected (error #{}): {}",
            self.consecutive_decode_errors,
            reason
        );

        if self.consecutive_decode_errors >= self.max_consecutive_errors {
            log::error!(
                "too many consecutive decode errors ({}), reinitializing decoder",
                self.consecutive_decode_errors
            );
            match self.init_decoder() {
                Ok(()) => self.decoder_resets += 1,
                Err(e) => log::error!("failed to reinitialize decoder: {}", e),
            }
            self.consecutive_decode_errors = 0;
        } else if fed_decoder {
            if let Some(decoder) = self.decoder.as_mut() {
                let discarded = decoder.drain_and_reset();
                log::debug!("decoder resync discarded {} pictures", discarded.len());
            }
        }
    }
}

impl Default for CodecSession {
    fn default() -> Self {
        Self::new(EncoderSettings::default())
    }
}

impl MediaCodec for CodecSession {
    fn init_decoder(&mut self) -> Result<(), CodecError> {
        let decoder = Decoder::low_latency(self.output_format).inspect_err(|e| {
            log::error!("failed to initialize decoder: {}", e);
        })?;
        // the previous decoder's state is discarded, not flushed
        self.decoder = Some(decoder);
        self.consecutive_decode_errors = 0;
        log::info!("low-latency decoder initialized");
        Ok(())
    }

    fn init_encoder(&mut self, width: u32, height: u32, fps: u32) -> Result<(), CodecError> {
        if let Some(mut old) = self.encoder.take() {
            self.encoder_initialized = false;
            let _ = old.send_eof();
            let _ = old.drain();
        }
        let encoder = Encoder::low_latency(&self.settings, width, height, fps).inspect_err(|e| {
            log::error!("failed to initialize encoder: {}", e);
        })?;
        self.encoder = Some(encoder);
        self.encoder_initialized = true;
        log::info!(
            "low-latency encoder initialized: {}x{} @ {}fps",
            width,
            height,
            fps
        );
        Ok(())
    }

    fn encoder_initialized(&self) -> bool {
        self.encoder_initialized
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<EncodedPacket>, CodecError> {
        if !self.encoder_initialized {
            return Err(CodecError::EncoderNotReady);
        }
        let encoder = self.encoder.as_mut().ok_or(CodecError::EncoderNotReady)?;
        encoder.send_frame(frame)?;
        let packets = encoder.drain()?;
        for packet in &packets {
            log::debug!(
                "encoded packet: {} bytes, pts {}, key {}",
                packet.len(),
                packet.timestamp(),
                packet.is_key()
            );
        }
        Ok(packets)
    }

    fn decode(&mut self, data: &[u8]) -> Vec<RawFrame> {
        if self.decoder.is_none() {
            log::error!("decoder not initialized");
            return Vec::new();
        }
        match self.decode_unit(data) {
            Ok(frames) => {
                self.consecutive_decode_errors = 0;
                frames
            }
            Err(CodecError::CorruptUnit(reason)) => {
                self.on_corrupt_unit(&reason, data.len() >= MIN_UNIT_SIZE);
                Vec::new()
            }
            Err(e) => {
                log::error!("unexpected error decoding: {}", e);
                Vec::new()
            }
        }
    }

    fn flush_encoder(&mut self) -> Vec<EncodedPacket> {
        if !self.encoder_initialized {
            return Vec::new();
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Vec::new();
        };
        let flushed = encoder.send_eof().and_then(|_| encoder.drain());
        match flushed {
            Ok(packets) => {
                log::info!("flushed {} packets from encoder", packets.len());
                packets
            }
            Err(e) => {
                log::error!("error flushing encoder: {}", e);
                Vec::new()
            }
        }
    }

    fn flush_decoder(&mut self) -> Vec<RawFrame> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Vec::new();
        };
        let pictures = decoder.drain_and_reset();
        self.pack(pictures)
    }

    fn close(&mut self) {
        let released = self.decoder.is_some() || self.encoder.is_some();
        if let Some(mut decoder) = self.decoder.take() {
            decoder.drain_and_reset();
        }
        if let Some(mut encoder) = self.encoder.take() {
            let _ = encoder.send_eof();
            let _ = encoder.drain();
        }
        self.encoder_initialized = false;
        self.consecutive_decode_errors = 0;
        self.decoded_frames = 0;
        if released {
            log::info!("codec session closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.decoder.is_none() && self.encoder.is_none()
    }
}

impl Drop for CodecSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
