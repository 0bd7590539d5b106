//! Core types and collaborator traits for the call engine
//!
//! This crate provides the foundational pieces shared by all other crates:
//! - Telephony audio utilities (μ-law decode, RMS energy)
//! - Call identifiers and transcript event types
//! - Conversation history types
//! - Collaborator traits for the external services the engine talks to
//!   (transcription, text generation, speech synthesis, outbound transport)
//! - Error types

pub mod audio;
pub mod call;
pub mod conversation;
pub mod error;
pub mod traits;

pub use audio::{mulaw_rms, mulaw_to_linear, AudioFormat, FrameDirection};
pub use call::{CallId, TranscriptEvent};
pub use conversation::{ConversationHistory, Turn, TurnRole};
pub use error::{Error, Result};
pub use traits::{
    OutboundAudio, SpeechSynthesizer, TextGenerator, Transcription, TranscriptionSession,
};
