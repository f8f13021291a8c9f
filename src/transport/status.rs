use std::{fmt, time::Duration};

/// Connection state transitions reported to the application. Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Idle,
    Connecting { attempt: u32 },
    Connected,
    /// `attempt` is the number of the attempt that just failed.
    Retrying { attempt: u32, delay: Duration },
    Disconnected,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStatus::Idle => write!(f, "idle"),
            TransportStatus::Connecting { attempt } => {
                write!(f, "connecting (attempt {})", attempt)
            }
            TransportStatus::Connected => write!(f, "connected"),
            TransportStatus::Retrying { attempt, delay } => write!(
                f,
                "attempt {} failed, retrying in {:.1}s",
                attempt,
                delay.as_secs_f64()
            ),
            TransportStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}
