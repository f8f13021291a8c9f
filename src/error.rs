use thiserror::Error;
use vidlink_codec::CodecError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    /// Connection dropped or reset during send or receive.
    #[error("transport io error: {0}")]
    Io(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("task failed: {0}")]
    Task(String),
    /// Permanent: the retry policy gave up.
    #[error("transport exhausted after {attempts} attempts, last error: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl TransportError {
    /// Whether the reconnect path applies. Contract violations and exhaustion are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Codec(e) => !e.is_contract_violation(),
            TransportError::Exhausted { .. } => false,
            _ => true,
        }
    }
}

impl From<tokio::task::JoinError> for TransportError {
    fn from(e: tokio::task::JoinError) -> Self {
        TransportError::Task(e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid value for {key}: {value:?}")]
    Env { key: String, value: String },
}
