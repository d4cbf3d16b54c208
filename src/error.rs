use std::path::PathBuf;

use llm::error::LLMError;
use thiserror::Error;

/// every failure a persona chat can surface. all of them are per-operation:
/// the session stays usable (retry the turn, pick another persona).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("persona not found: '{name}'")]
    PersonaNotFound { name: String },

    #[error("failed to read persona '{name}': {message}")]
    PersonaIo { name: String, message: String },

    #[error("failed to list personas in {}: {message}", path.display())]
    PersonaDirectory { path: PathBuf, message: String },

    #[error("no persona selected")]
    NoPersonaSelected,

    #[error("message is empty")]
    EmptyMessage,

    /// a request is already in flight for this session.
    #[error("session is busy with another request")]
    Busy,

    #[error("remote call failed: {0}")]
    RemoteCall(String),

    /// the provider could not be constructed (bad backend/model/key config).
    #[error("provider error: {0}")]
    Provider(String),
}

impl From<LLMError> for ChatError {
    fn from(err: LLMError) -> Self {
        ChatError::RemoteCall(err.to_string())
    }
}
