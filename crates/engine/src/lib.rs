//! Half-duplex turn-taking engine for telephone calls
//!
//! A host process drives one [`CallEngine`] with three entry points:
//! `on_call_start`, `on_inbound_frame`, and `on_call_end`. Per call,
//! the engine runs a voice activity detector and barge-in arbiter on
//! the inbound frame path, feeds audio to the transcription
//! collaborator, and answers finalized utterances through the turn
//! controller and paced sender.

pub mod engine;
pub mod error;
pub mod session;

pub use engine::CallEngine;
pub use error::EngineError;

pub use call_engine_config::{load_settings, EngineSettings, Settings};
pub use call_engine_core::{
    AudioFormat, CallId, FrameDirection, OutboundAudio, SpeechSynthesizer, TextGenerator,
    Transcription, TranscriptEvent,
};
