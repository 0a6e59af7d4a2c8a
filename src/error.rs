//! Error taxonomy for session control and orchestration.

use mux_session::SessionError;

/// Failures surfaced by controllers, orchestrators, and the conversation
/// layer.
///
/// Transport errors ([`CoreError::Backend`]) are the only transient class:
/// the retry policy re-attempts those and nothing else. A dead session is
/// final for the current lifecycle; the auto-restarter owns recovery.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("session '{0}' already exists")]
    SessionAlreadyExists(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{0}' is dead")]
    SessionDead(String),

    #[error("session '{0}' is unresponsive")]
    SessionUnresponsive(String),

    #[error("session '{session}' failed to start within {timeout_secs}s")]
    StartupTimeout { session: String, timeout_secs: u64 },

    #[error("command timed out: {message}")]
    CommandTimeout {
        message: String,
        partial_output: Option<String>,
    },

    #[error("malformed command: {0}")]
    CommandMalformed(String),

    #[error("executable '{0}' not found")]
    ExecutableNotFound(String),

    #[error("no backend available: {0}")]
    BackendNotFound(String),

    #[error("unknown controller '{0}'")]
    UnknownController(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("output capture returned nothing")]
    OutputEmpty,

    #[error("output could not be parsed: {0}")]
    OutputMalformed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Whether the retry policy may re-attempt the failed operation.
    ///
    /// Only generic transport failures qualify; everything else either
    /// carries state (timeouts), is permanent (dead session, missing
    /// executable), or is a programming error (malformed command).
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Backend(_))
    }
}

impl From<SessionError> for CoreError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(name) => CoreError::SessionNotFound(name),
            SessionError::AlreadyExists(name) => CoreError::SessionAlreadyExists(name),
            SessionError::InvalidName(msg) => CoreError::CommandMalformed(msg),
            SessionError::MultiplexerNotFound => {
                CoreError::BackendNotFound("terminal multiplexer not installed".to_string())
            }
            SessionError::Backend(msg) => CoreError::Backend(msg),
            SessionError::Io(err) => CoreError::Backend(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CoreError::Backend("socket closed".to_string()).is_transient());

        assert!(!CoreError::SessionDead("crew".to_string()).is_transient());
        assert!(!CoreError::SessionNotFound("crew".to_string()).is_transient());
        assert!(!CoreError::CommandTimeout {
            message: "no response".to_string(),
            partial_output: Some("partial".to_string()),
        }
        .is_transient());
        assert!(!CoreError::StartupTimeout {
            session: "crew".to_string(),
            timeout_secs: 30,
        }
        .is_transient());
    }

    #[test]
    fn test_session_error_conversion() {
        let err: CoreError = SessionError::NotFound("crew".to_string()).into();
        assert!(matches!(err, CoreError::SessionNotFound(name) if name == "crew"));

        let err: CoreError = SessionError::Backend("boom".to_string()).into();
        assert!(err.is_transient());
    }
}
