use thiserror::Error;

#[derive(Error, Debug)]
pub enum HmuxError {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Pool exhausted for backend {backend} (max {max} connections)")]
    PoolExhausted { backend: String, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Socket timeout after {0}ms")]
    Timeout(u64),

    #[error("No backend available")]
    NoBackendAvailable,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HmuxError {
    /// True when the error means the backend itself is unreachable or broken
    /// mid-request, as opposed to a local decoding problem.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, HmuxError::Transport(_) | HmuxError::Timeout(_))
    }

    /// True when the same request may be tried against another backend.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HmuxError::Connect(_) | HmuxError::PoolExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, HmuxError>;

/// Map IO errors to the connector's error taxonomy.
///
/// - Timeouts/would block -> `Timeout`
/// - Everything else -> `Transport`, prefixed with what was being done
pub fn map_io_error(err: std::io::Error, context: &str, timeout_ms: u64) -> HmuxError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            HmuxError::Timeout(timeout_ms)
        }
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected => {
            HmuxError::Transport(format!("{}: connection lost", context))
        }
        _ => HmuxError::Transport(format!("{}: {}", context, err)),
    }
}
