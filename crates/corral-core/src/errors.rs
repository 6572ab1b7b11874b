/// Typed error hierarchy for execution backends.
/// Classifies failures by how the orchestrator must react to them.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    // Fatal to a single start attempt
    #[error("startup failed: {0}")]
    StartupFailure(String),

    // Stream-level
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("protocol error: {0}")]
    Protocol(String),

    // Request-level
    #[error("backend session not found: {0}")]
    SessionNotFound(String),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("unsupported by {backend} backend: {operation}")]
    Unsupported { backend: &'static str, operation: &'static str },

    // Operational
    #[error("cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::StartupFailure(_) => "startup_failure",
            Self::ConnectionLost(_) => "connection_lost",
            Self::Protocol(_) => "protocol",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Http { .. } => "http",
            Self::Runtime(_) => "runtime",
            Self::Io(_) => "io",
            Self::Unsupported { .. } => "unsupported",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify a non-success worker/control-plane response.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            404 => Self::SessionNotFound(body),
            _ => Self::Http { status, body },
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
