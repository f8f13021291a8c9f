use ffmpeg_next::{Dictionary, Rational, format::Pixel};

use crate::{error::CodecError, frame::RawFrame, hw, packet::EncodedPacket, scaler::Scaler};

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub codec: String,
    // "ultrafast", "veryfast", ...
    pub preset: String,
    // bps
    pub bitrate: usize,
    // keyframe interval in frames, None = one second at the target rate
    pub gop: Option<u32>,
    // bytes per slice, keeps units below the network MTU
    pub slice_max_size: usize,
    pub hardware: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            bitrate: 10 << 20,
            gop: None,
            slice_max_size: 1500,
            hardware: false,
        }
    }
}

/// H.264 encoder tuned for minimum latency: one reference frame, no B-frames,
/// no look-ahead, intra refresh and sliced output.
pub struct Encoder {
    inner: ffmpeg_next::codec::encoder::Video,
    codec_name: String,
    width: u32,
    height: u32,
    frame_index: i64,
    scaler: Option<Scaler>,
}

impl Encoder {
    pub fn low_latency(
        settings: &EncoderSettings,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Self, CodecError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(CodecError::Init(format!(
                "invalid encoder size {}x{} (yuv420p needs even, non-zero dimensions)",
                width, height
            )));
        }
        if fps == 0 {
            return Err(CodecError::Init("frame rate must be positive".to_string()));
        }

        if settings.hardware {
            if let Some(hw_codec) = hw::find_hw_encoder() {
                let hw_name = hw_codec.name().to_string();
                log::info!("attempting hardware encoder: {}", hw_name);
                let opts = hw::low_latency_options(&hw_name);
                match Self::open(hw_codec, &hw_name, opts, settings, width, height, fps) {
                    Ok(encoder) => return Ok(encoder),
                    Err(e) => log::warn!(
                        "hardware encoder {} failed: {}, falling back to {}",
                        hw_name,
                        e,
                        settings.codec
                    ),
                }
            } else {
                log::info!(
                    "no hardware encoder found, using software encoder: {}",
                    settings.codec
                );
            }
        }

        let sw_codec = ffmpeg_next::encoder::find_by_name(&settings.codec)
            .ok_or_else(|| CodecError::Init(format!("codec not found: {}", settings.codec)))?;
        Self::open(
            sw_codec,
            &settings.codec,
            Self::x264_options(settings),
            settings,
            width,
            height,
            fps,
        )
    }

    fn x264_options(settings: &EncoderSettings) -> Dictionary<'static> {
        let mut opts = Dictionary::new();
        opts.set("preset", &settings.preset);
        opts.set("tune", "zerolatency");
        opts.set("intra-refresh", "1");
        opts.set("slice-max-size", &settings.slice_max_size.to_string());
        opts.set("x264opts", "bframes=0:ref=1:rc-lookahead=0");
        opts
    }

    fn open(
        codec: ffmpeg_next::Codec,
        name: &str,
        opts: Dictionary,
        settings: &EncoderSettings,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Self, CodecError> {
        let init_err = |e: ffmpeg_next::Error| CodecError::Init(format!("{}: {}", name, e));

        let context = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = context.encoder().video().map_err(init_err)?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(Rational::new(1, fps as i32));
        encoder.set_frame_rate(Some(Rational::new(fps as i32, 1)));
        encoder.set_bit_rate(settings.bitrate);
        encoder.set_gop(settings.gop.unwrap_or(fps));
        encoder.set_max_b_frames(0);
        let inner = encoder.open_with(opts).map_err(init_err)?;
        log::info!(
            "encoder opened successfully: {} {}x{} @ {}fps",
            name,
            width,
            height,
            fps
        );

        Ok(Self {
            inner,
            codec_name: name.to_string(),
            width,
            height,
            frame_index: 0,
            scaler: None,
        })
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Presentation counter, advanced once per submitted frame.
    pub fn frame_index(&self) -> i64 {
        self.frame_index
    }

    pub fn send_frame(&mut self, frame: &RawFrame) -> Result<(), CodecError> {
        if !frame.same_size(self.width, self.height) {
            return Err(CodecError::DimensionMismatch {
                width: self.width,
                height: self.height,
                got_width: frame.width(),
                got_height: frame.height(),
            });
        }

        let source = frame.to_video();
        let scaler = match self.scaler.take() {
            Some(scaler) if scaler.accepts(&source) => self.scaler.insert(scaler),
            _ => self.scaler.insert(Scaler::convert(
                (source.format(), self.width, self.height),
                (Pixel::YUV420P, self.width, self.height),
            )?),
        };
        let mut converted = ffmpeg_next::frame::Video::empty();
        scaler.run(&source, &mut converted)?;
        converted.set_pts(Some(self.frame_index));

        self.inner
            .send_frame(&converted)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        self.frame_index += 1;
        Ok(())
    }

    pub fn send_eof(&mut self) -> Result<(), CodecError> {
        self.inner
            .send_eof()
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn receive_packet(&mut self) -> Result<Option<EncodedPacket>, CodecError> {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        match self.inner.receive_packet(&mut packet) {
            Ok(()) => Ok(Some(EncodedPacket::from(&packet))),
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(CodecError::Encode(err.to_string())),
        }
    }

    /// Collects every packet the encoder has ready.
    pub fn drain(&mut self) -> Result<Vec<EncodedPacket>, CodecError> {
        let mut packets = Vec::new();
        while let Some(packet) = self.receive_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }
}
