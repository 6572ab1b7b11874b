use corral_core::collaborators::CollaboratorError;
use corral_core::errors::BackendError;
use corral_core::session::SessionStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("cannot {operation} while session is {}", status.as_str())]
    InvalidState { operation: &'static str, status: SessionStatus },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("agent reported failure: {0}")]
    Agent(String),

    #[error("no plan available for session {0}")]
    NoPlan(String),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Backend(e) => e.error_kind(),
            Self::Agent(_) => "agent",
            Self::NoPlan(_) => "no_plan",
            Self::Collaborator(_) => "collaborator",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_names_status() {
        let e = EngineError::InvalidState { operation: "answer", status: SessionStatus::Running };
        assert_eq!(e.to_string(), "cannot answer while session is running");
        assert_eq!(e.error_kind(), "invalid_state");
    }

    #[test]
    fn backend_kind_passes_through() {
        let e: EngineError = BackendError::ConnectionLost("eof".into()).into();
        assert_eq!(e.error_kind(), "connection_lost");
    }
}
