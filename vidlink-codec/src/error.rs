use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Encoder or decoder could not be allocated or configured.
    #[error("codec init failed: {0}")]
    Init(String),
    /// `encode` was called before the encoder was initialized.
    #[error("encoder not initialized")]
    EncoderNotReady,
    #[error("frame is {got_width}x{got_height}, encoder expects {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// Truncated or malformed compressed unit. Recovered inside the session.
    #[error("corrupt unit: {0}")]
    CorruptUnit(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("pixel conversion failed: {0}")]
    Conversion(String),
}

impl CodecError {
    /// Contract violations are reported to the caller, never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            CodecError::EncoderNotReady | CodecError::DimensionMismatch { .. }
        )
    }
}
