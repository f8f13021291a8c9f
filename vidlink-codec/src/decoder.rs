use crate::{
    error::CodecError,
    frame::{PixelFormat, RawFrame},
    scaler::Scaler,
};

/// H.264 decoder configured to emit each picture as soon as it is complete.
pub struct Decoder {
    inner: ffmpeg_next::codec::decoder::Video,
    output_format: PixelFormat,
    scaler: Option<Scaler>,
}

impl Decoder {
    pub fn low_latency(output_format: PixelFormat) -> Result<Self, CodecError> {
        let codec = ffmpeg_next::decoder::find(ffmpeg_next::codec::Id::H264)
            .ok_or_else(|| CodecError::Init("h264 decoder not found".to_string()))?;
        let mut context = ffmpeg_next::codec::Context::new_with_codec(codec);
        // frame threading delays output by one frame per worker
        context.set_threading(ffmpeg_next::codec::threading::Config {
            kind: ffmpeg_next::codec::threading::Type::Slice,
            count: 1,
            ..Default::default()
        });
        context.set_flags(ffmpeg_next::codec::Flags::LOW_DELAY);
        let inner = context
            .decoder()
            .video()
            .map_err(|e| CodecError::Init(format!("h264 decoder: {}", e)))?;

        Ok(Self {
            inner,
            output_format,
            scaler: None,
        })
    }

    pub fn send_packet(&mut self, data: &[u8]) -> Result<(), ffmpeg_next::Error> {
        let packet = ffmpeg_next::Packet::copy(data);
        self.inner.send_packet(&packet)
    }

    pub fn send_eof(&mut self) -> Result<(), ffmpeg_next::Error> {
        self.inner.send_eof()
    }

    pub fn receive_frame(
        &mut self,
    ) -> Result<Option<ffmpeg_next::frame::Video>, ffmpeg_next::Error> {
        let mut frame = ffmpeg_next::frame::Video::empty();
        match self.inner.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(frame)),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Drains pending pictures after `send_eof`, then clears the EOF state so
    /// the decoder accepts packets again.
    pub fn drain_and_reset(&mut self) -> Vec<ffmpeg_next::frame::Video> {
        let mut frames = Vec::new();
        if let Err(e) = self.send_eof() {
            log::debug!("decoder send eof error: {}", e);
        }
        loop {
            match self.receive_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    log::debug!("decoder drain error: {}", e);
                    break;
                }
            }
        }
        self.inner.flush();
        frames
    }

    /// Packs a decoded picture into the configured output format.
    pub fn to_raw(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        sequence: u64,
    ) -> Result<RawFrame, CodecError> {
        let target = self.output_format.as_pixel();
        if frame.format() == target {
            return RawFrame::from_video(frame, self.output_format, sequence);
        }
        let scaler = match self.scaler.take() {
            Some(scaler) if scaler.accepts(frame) => self.scaler.insert(scaler),
            _ => self.scaler.insert(Scaler::convert(
                (frame.format(), frame.width(), frame.height()),
                (target, frame.width(), frame.height()),
            )?),
        };
        let mut converted = ffmpeg_next::frame::Video::empty();
        scaler.run(frame, &mut converted)?;
        RawFrame::from_video(&converted, self.output_format, sequence)
    }
}
