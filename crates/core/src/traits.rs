//! Collaborator traits
//!
//! The engine talks to four external collaborators through these narrow
//! interfaces. Everything behind them (STT vendor, LLM, TTS vendor, the
//! signaling transport) is out of scope for this workspace; tests use
//! in-memory mocks.

use crate::audio::AudioFormat;
use crate::call::{CallId, TranscriptEvent};
use crate::conversation::Turn;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Live transcription session for one call.
///
/// `send_audio` must not block the caller's frame path: implementations
/// enqueue the frame and return immediately. `close` is called exactly
/// once by the engine at call teardown and must be idempotent.
pub trait TranscriptionSession: Send + Sync {
    /// Feed one inbound audio frame to the recognizer.
    fn send_audio(&self, frame: &[u8]) -> Result<()>;

    /// Close the session, releasing the provider connection.
    fn close(&self);
}

/// Speech-to-text collaborator.
///
/// Opening a session yields the session handle plus the receiver on which
/// partial and final [`TranscriptEvent`]s arrive, in utterance order.
#[async_trait]
pub trait Transcription: Send + Sync + 'static {
    async fn open(
        &self,
        call: &CallId,
        format: AudioFormat,
    ) -> Result<(Box<dyn TranscriptionSession>, mpsc::Receiver<TranscriptEvent>)>;
}

/// Text-generation collaborator (LLM or otherwise).
///
/// Cancellation on a stale speech token is an optimization the engine does
/// not rely on; a late result is simply dropped by the turn controller.
#[async_trait]
pub trait TextGenerator: Send + Sync + 'static {
    /// Produce a reply to `utterance` given recent conversation history.
    async fn generate(&self, history: &[Turn], utterance: &str) -> Result<String>;
}

/// Speech-synthesis collaborator.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync + 'static {
    /// Synthesize `text` into audio bytes in the call's frame encoding
    /// (8 kHz μ-law for telephony calls).
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Outbound half of the signaling transport.
///
/// Only the paced sender writes audio frames; only the turn controller and
/// barge-in path issue `clear`. `buffered_bytes` is the transport's
/// backpressure probe, queried at send time.
#[async_trait]
pub trait OutboundAudio: Send + Sync + 'static {
    /// Send one encoded audio frame to the caller.
    async fn send_frame(&self, call: &CallId, frame: &[u8]) -> Result<()>;

    /// Tell the transport to discard any client-side queued audio.
    async fn clear(&self, call: &CallId) -> Result<()>;

    /// Bytes currently queued toward the client, for backpressure.
    fn buffered_bytes(&self, call: &CallId) -> usize;
}
