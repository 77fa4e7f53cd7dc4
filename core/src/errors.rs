use thiserror::Error;
use ttymux_protocol::SessionId;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Caller error: the requested program kind is not in the catalog.
    /// Surfaced before any process is spawned; no session state is created.
    #[error("unknown program `{program}`")]
    UnknownProgram { program: String },
    /// Caller error: the requested variant is not declared for the program.
    #[error("unknown variant `{variant}` for program `{program}`")]
    UnknownVariant { program: String, variant: String },
    /// Operation on an unknown or already-destroyed session id.
    #[error("unknown session id {session_id}")]
    SessionNotFound { session_id: SessionId },
    /// The underlying pseudo-terminal process could not be created. No
    /// session is registered when this is returned.
    #[error("failed to spawn session process: {source}")]
    SpawnFailed {
        #[source]
        source: anyhow::Error,
    },
}

impl SessionError {
    pub(crate) fn unknown_program(program: &str) -> Self {
        Self::UnknownProgram {
            program: program.to_string(),
        }
    }

    pub(crate) fn unknown_variant(program: &str, variant: &str) -> Self {
        Self::UnknownVariant {
            program: program.to_string(),
            variant: variant.to_string(),
        }
    }

    pub(crate) fn not_found(session_id: &SessionId) -> Self {
        Self::SessionNotFound {
            session_id: session_id.clone(),
        }
    }

    pub(crate) fn spawn_failed(source: anyhow::Error) -> Self {
        Self::SpawnFailed { source }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
