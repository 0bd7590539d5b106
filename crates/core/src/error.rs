//! Error types shared across the engine

use thiserror::Error;

/// Core error type for collaborator and audio failures.
///
/// Collaborator failures are call-scoped and recoverable; nothing here
/// should ever terminate the host process.
#[derive(Debug, Error)]
pub enum Error {
    /// Transcription collaborator failure
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Text generation collaborator failure
    #[error("text generation error: {0}")]
    Generation(String),

    /// Speech synthesis collaborator failure
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Outbound transport failure (send or clear)
    #[error("transport error: {0}")]
    Transport(String),

    /// Collaborator call exceeded its deadline
    #[error("collaborator timed out: {0}")]
    Timeout(String),
}

/// Result alias using the core error type.
pub type Result<T> = std::result::Result<T, Error>;
