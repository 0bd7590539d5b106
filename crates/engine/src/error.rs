//! Engine error types

use call_engine_core::CallId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Frame or directive for a call the engine does not know.
    #[error("unknown call: {0}")]
    UnknownCall(CallId),

    /// `on_call_start` for a call that is already live.
    #[error("call already started: {0}")]
    DuplicateCall(CallId),

    /// Concurrent-call limit reached.
    #[error("at capacity: {0} concurrent calls")]
    AtCapacity(usize),

    /// Collaborator failure during call setup.
    #[error(transparent)]
    Core(#[from] call_engine_core::Error),
}
