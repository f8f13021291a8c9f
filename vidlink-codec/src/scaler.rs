use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context, Flags};

use crate::error::CodecError;

/// Pixel format and size converter between the packed frame model and codec layouts.
pub struct Scaler {
    context: Context,
}

impl Scaler {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    pub fn convert(
        src: (Pixel, u32, u32),
        dst: (Pixel, u32, u32),
    ) -> Result<Self, CodecError> {
        let context = Context::get(src.0, src.1, src.2, dst.0, dst.1, dst.2, Flags::BILINEAR)
            .map_err(|e| {
                CodecError::Conversion(format!(
                    "scaler {:?} {}x{} -> {:?} {}x{}: {}",
                    src.0, src.1, src.2, dst.0, dst.1, dst.2, e
                ))
            })?;
        Ok(Self::new(context))
    }

    /// Whether this scaler was built for frames shaped like `frame`.
    pub fn accepts(&self, frame: &ffmpeg_next::frame::Video) -> bool {
        let input = self.context.input();
        input.format == frame.format()
            && input.width == frame.width()
            && input.height == frame.height()
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> Result<(), CodecError> {
        self.context
            .run(frame, dst)
            .map_err(|e| CodecError::Conversion(e.to_string()))
    }
}

unsafe impl Send for Scaler {}
