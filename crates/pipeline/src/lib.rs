//! Per-call audio pipeline
//!
//! Everything that runs on a single call's frame and timer events: the
//! voice activity detector, the paced outbound sender, the barge-in
//! arbiter, and the turn controller that ties them to the external
//! collaborators.

pub mod barge_in;
pub mod pacer;
pub mod turn;
pub mod vad;

pub use barge_in::{BargeInConfig, BargeInDetector};
pub use pacer::{PacedSender, PacerConfig, PacerEvent};
pub use turn::{TurnConfig, TurnController};
pub use vad::{VadConfig, VadDecision, VoiceGate};
