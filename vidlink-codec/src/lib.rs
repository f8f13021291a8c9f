/// Registers FFmpeg components. Call once at startup before opening any codec.
pub fn init() -> Result<(), CodecError> {
    ffmpeg_next::init().map_err(|e| CodecError::Init(format!("ffmpeg_next init: {}", e)))
}

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod hw;
pub mod packet;
pub mod scaler;
pub mod session;

pub use error::CodecError;
pub use frame::{PixelFormat, RawFrame, resize};
pub use packet::EncodedPacket;
pub use session::{CodecSession, DEFAULT_MAX_CONSECUTIVE_ERRORS, MIN_UNIT_SIZE, MediaCodec};
