//! Turn-taking control
//!
//! One controller per call drives the Idle → AwaitingReply → Speaking
//! loop: partial transcripts accumulate into a pending utterance, a
//! finalized utterance is answered through the text and synthesis
//! collaborators, and the reply is handed to the paced sender. The
//! speech token — a monotonically increasing counter — is the sole
//! cancellation mechanism: work captures the token up front and drops
//! its result if the live token has moved on.

use crate::pacer::PacedSender;
use call_engine_core::{
    CallId, ConversationHistory, Error, OutboundAudio, Result, SpeechSynthesizer, TextGenerator,
    TranscriptEvent, Turn,
};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Turn-taking tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Window after a playback stop during which new finalized
    /// utterances are ignored, so the tail of our own audio does not
    /// get answered. Zero disables it.
    pub cooldown_ms: u64,
    /// Deadline for each generator/synthesizer call.
    pub collaborator_timeout_ms: u64,
    /// Spoken when generation or synthesis fails.
    pub fallback_utterance: String,
    /// Optional line spoken once at call start.
    pub greeting: Option<String>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 250,
            collaborator_timeout_ms: 10_000,
            fallback_utterance: "Sorry, could you say that again?".to_string(),
            greeting: None,
        }
    }
}

/// Turn controller for one call.
///
/// Shared between the frame path (barge-in stops) and the transcript
/// pump; all methods take `&self`.
pub struct TurnController {
    call: CallId,
    config: TurnConfig,
    generator: Arc<dyn TextGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transport: Arc<dyn OutboundAudio>,
    sender: Arc<PacedSender>,
    token: AtomicU64,
    in_flight: AtomicBool,
    playback_active: AtomicBool,
    closed: AtomicBool,
    pending: Mutex<String>,
    queued: Mutex<Option<String>>,
    last_stop: Mutex<Option<Instant>>,
    last_answered: Mutex<Option<String>>,
    last_reply: Mutex<Option<String>>,
    history: Mutex<ConversationHistory>,
}

impl TurnController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call: CallId,
        config: TurnConfig,
        history_limit: usize,
        generator: Arc<dyn TextGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transport: Arc<dyn OutboundAudio>,
        sender: Arc<PacedSender>,
    ) -> Self {
        Self {
            call,
            config,
            generator,
            synthesizer,
            transport,
            sender,
            token: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            playback_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pending: Mutex::new(String::new()),
            queued: Mutex::new(None),
            last_stop: Mutex::new(None),
            last_answered: Mutex::new(None),
            last_reply: Mutex::new(None),
            history: Mutex::new(ConversationHistory::new(history_limit)),
        }
    }

    pub fn current_token(&self) -> u64 {
        self.token.load(Ordering::SeqCst)
    }

    fn advance_token(&self) -> u64 {
        self.token.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn playback_active(&self) -> bool {
        self.playback_active.load(Ordering::SeqCst)
    }

    /// Recent conversation turns, oldest first.
    pub fn history(&self) -> Vec<Turn> {
        self.history.lock().turns().to_vec()
    }

    /// Refuse all further turns. Called at call teardown so work still
    /// in flight on a detached task cannot start playback afterwards.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.advance_token();
    }

    /// Called when a pacing run completes on its own.
    pub fn on_playback_complete(&self) {
        if self.playback_active.swap(false, Ordering::SeqCst) {
            *self.last_stop.lock() = Some(Instant::now());
            debug!(call_id = %self.call, "playback complete");
        }
    }

    /// Tear down any active playback: advance the speech token so
    /// in-flight work goes stale, halt the sender, and tell the
    /// transport to drop queued audio. Returns whether audio was
    /// actually playing.
    pub async fn stop_playback(&self) -> bool {
        self.advance_token();
        self.sender.stop();
        // The interrupted exchange no longer counts as answered: the
        // caller cut the reply off (or never heard it), so the same
        // utterance and the same reply text are eligible again.
        *self.last_answered.lock() = None;
        *self.last_reply.lock() = None;
        let was_active = self.playback_active.swap(false, Ordering::SeqCst);
        if was_active {
            *self.last_stop.lock() = Some(Instant::now());
            if let Err(err) = self.transport.clear(&self.call).await {
                warn!(call_id = %self.call, error = %err, "transport clear failed");
            }
        }
        was_active
    }

    /// Speak the configured greeting, if any, under normal token
    /// discipline (a barge-in during synthesis drops it).
    pub async fn speak_greeting(&self) {
        let Some(greeting) = self.config.greeting.clone() else {
            return;
        };
        if greeting.trim().is_empty() {
            return;
        }
        let token = self.current_token();
        self.history.lock().push(Turn::assistant(greeting.clone()));
        self.speak(&greeting, token).await;
    }

    /// Feed one transcript event. Partials update the pending
    /// utterance; a final launches a turn. Empty finals are ignored.
    pub async fn on_transcript(&self, event: TranscriptEvent) {
        let text = normalize_ws(&event.text);
        if !text.is_empty() {
            *self.pending.lock() = text;
        }
        if event.is_final {
            let utterance = std::mem::take(&mut *self.pending.lock());
            if utterance.is_empty() {
                return;
            }
            self.on_final_utterance(utterance).await;
        }
    }

    async fn on_final_utterance(&self, utterance: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // A newer utterance supersedes whatever is in flight or playing:
        // invalidate it before dispatching the new turn's work.
        let superseding =
            self.in_flight.load(Ordering::SeqCst) || self.playback_active.load(Ordering::SeqCst);
        if superseding {
            debug!(call_id = %self.call, "finalized utterance supersedes active turn");
            self.stop_playback().await;
        }

        // The queued slot and the in-flight flag transition together
        // under the queued lock, so a superseding utterance is either
        // picked up by the running turn's drain or runs here itself.
        {
            let mut queued = self.queued.lock();
            if self.in_flight.swap(true, Ordering::SeqCst) {
                *queued = Some(utterance);
                return;
            }
        }

        let mut current = utterance;
        let mut skip_cooldown = superseding;
        loop {
            self.run_turn(&current, skip_cooldown).await;
            let next = {
                let mut queued = self.queued.lock();
                match queued.take() {
                    Some(next) => Some(next),
                    None => {
                        self.in_flight.store(false, Ordering::SeqCst);
                        None
                    }
                }
            };
            match next {
                Some(next) => {
                    current = next;
                    skip_cooldown = true;
                }
                None => break,
            }
        }
    }

    async fn run_turn(&self, utterance: &str, skip_cooldown: bool) {
        if !skip_cooldown && self.config.cooldown_ms > 0 {
            let within = match *self.last_stop.lock() {
                Some(stopped) => stopped.elapsed() < Duration::from_millis(self.config.cooldown_ms),
                None => false,
            };
            if within {
                debug!(call_id = %self.call, utterance, "within post-stop cooldown, ignoring");
                return;
            }
        }
        if self.last_answered.lock().as_deref() == Some(utterance) {
            debug!(call_id = %self.call, utterance, "repeats previous turn, ignoring");
            return;
        }

        let token = self.current_token();
        info!(call_id = %self.call, token, utterance, "caller turn");

        let context = self.history.lock().turns().to_vec();
        let reply = match self.generate(&context, utterance).await {
            Ok(text) if !text.trim().is_empty() => normalize_ws(&text),
            Ok(_) => {
                warn!(call_id = %self.call, "generator returned empty reply, using fallback");
                counter!("call_engine_fallback_replies_total").increment(1);
                self.config.fallback_utterance.clone()
            }
            Err(err) => {
                warn!(call_id = %self.call, error = %err, "text generation failed, using fallback");
                counter!("call_engine_fallback_replies_total").increment(1);
                self.config.fallback_utterance.clone()
            }
        };

        let repeat = self.last_reply.lock().as_deref() == Some(reply.as_str());
        if repeat {
            debug!(call_id = %self.call, "reply repeats the last one spoken, not re-spoken");
            self.history.lock().push(Turn::caller(utterance));
            *self.last_answered.lock() = Some(utterance.to_string());
            return;
        }
        {
            let mut history = self.history.lock();
            history.push(Turn::caller(utterance));
            history.push(Turn::assistant(reply.clone()));
        }
        *self.last_answered.lock() = Some(utterance.to_string());
        *self.last_reply.lock() = Some(reply.clone());

        self.speak(&reply, token).await;
    }

    /// Synthesize `text` and start playback unless `token` went stale.
    async fn speak(&self, text: &str, token: u64) {
        let audio = match self.synthesize(text).await {
            Ok(audio) => audio,
            Err(err) => {
                warn!(call_id = %self.call, error = %err, "synthesis failed");
                if text == self.config.fallback_utterance {
                    return;
                }
                counter!("call_engine_fallback_replies_total").increment(1);
                let fallback = self.config.fallback_utterance.clone();
                match self.synthesize(&fallback).await {
                    Ok(audio) => audio,
                    Err(err) => {
                        warn!(call_id = %self.call, error = %err, "fallback synthesis failed, staying silent");
                        return;
                    }
                }
            }
        };
        if audio.is_empty() {
            return;
        }
        if self.closed.load(Ordering::SeqCst) || self.current_token() != token {
            debug!(call_id = %self.call, token, "discarding stale synthesized audio");
            return;
        }
        if let Err(err) = self.transport.clear(&self.call).await {
            warn!(call_id = %self.call, error = %err, "transport clear failed");
        }
        self.playback_active.store(true, Ordering::SeqCst);
        self.sender.push(&audio);
        self.sender.finish();
        // A stop that raced the push above would leave the sender
        // restarted with stale audio; re-check and undo.
        if self.current_token() != token {
            self.sender.stop();
            self.playback_active.store(false, Ordering::SeqCst);
            return;
        }
        debug!(call_id = %self.call, token, bytes = audio.len(), "playback started");
    }

    async fn generate(&self, history: &[Turn], utterance: &str) -> Result<String> {
        let deadline = Duration::from_millis(self.config.collaborator_timeout_ms);
        match tokio::time::timeout(deadline, self.generator.generate(history, utterance)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("text generation".into())),
        }
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let deadline = Duration::from_millis(self.config.collaborator_timeout_ms);
        match tokio::time::timeout(deadline, self.synthesizer.synthesize(text)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("speech synthesis".into())),
        }
    }
}

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer::{PacerConfig, PacerEvent};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct ScriptedGenerator {
        replies: Mutex<Vec<Result<String>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, _history: &[Turn], utterance: &str) -> Result<String> {
            self.calls.lock().push(utterance.to_string());
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                Ok(format!("reply to {utterance}"))
            } else {
                replies.remove(0)
            }
        }
    }

    /// Synthesizer producing two frames of a marker byte derived from
    /// the text length, after an optional per-call delay.
    struct TestSynth {
        delay_ms: Mutex<Vec<u64>>,
        calls: Mutex<Vec<String>>,
    }

    impl TestSynth {
        fn new(delay_ms: Vec<u64>) -> Arc<Self> {
            Arc::new(Self {
                delay_ms: Mutex::new(delay_ms),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for TestSynth {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
            self.calls.lock().push(text.to_string());
            let delay = {
                let mut delays = self.delay_ms.lock();
                if delays.is_empty() {
                    0
                } else {
                    delays.remove(0)
                }
            };
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(vec![text.len() as u8; 320])
        }
    }

    struct TestTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        clears: AtomicUsize,
    }

    impl TestTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                clears: AtomicUsize::new(0),
            })
        }

        fn sent_markers(&self) -> Vec<u8> {
            let mut markers: Vec<u8> = self.sent.lock().iter().map(|f| f[0]).collect();
            markers.dedup();
            markers
        }
    }

    #[async_trait]
    impl OutboundAudio for TestTransport {
        async fn send_frame(&self, _call: &CallId, frame: &[u8]) -> Result<()> {
            self.sent.lock().push(frame.to_vec());
            Ok(())
        }

        async fn clear(&self, _call: &CallId) -> Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn buffered_bytes(&self, _call: &CallId) -> usize {
            0
        }
    }

    struct Fixture {
        controller: Arc<TurnController>,
        transport: Arc<TestTransport>,
        generator: Arc<ScriptedGenerator>,
        synth: Arc<TestSynth>,
        events: mpsc::UnboundedReceiver<PacerEvent>,
    }

    fn fixture(config: TurnConfig, replies: Vec<Result<String>>, synth_delays: Vec<u64>) -> Fixture {
        let call = CallId::new("CA1");
        let transport = TestTransport::new();
        let generator = ScriptedGenerator::new(replies);
        let synth = TestSynth::new(synth_delays);
        let (sender, events) = PacedSender::new(
            call.clone(),
            PacerConfig::default(),
            Arc::clone(&transport) as Arc<dyn OutboundAudio>,
        );
        let controller = Arc::new(TurnController::new(
            call,
            config,
            30,
            Arc::clone(&generator) as Arc<dyn TextGenerator>,
            Arc::clone(&synth) as Arc<dyn SpeechSynthesizer>,
            Arc::clone(&transport) as Arc<dyn OutboundAudio>,
            Arc::new(sender),
        ));
        Fixture {
            controller,
            transport,
            generator,
            synth,
            events,
        }
    }

    fn no_cooldown() -> TurnConfig {
        TurnConfig {
            cooldown_ms: 0,
            ..TurnConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_utterance_produces_playback() {
        let mut fx = fixture(no_cooldown(), vec![Ok("hello there".into())], vec![]);
        fx.controller
            .on_transcript(TranscriptEvent::partial("what is"))
            .await;
        fx.controller
            .on_transcript(TranscriptEvent::final_("what is the price"))
            .await;

        assert_eq!(fx.events.recv().await, Some(PacerEvent::Completed));
        assert_eq!(fx.generator.calls.lock().as_slice(), ["what is the price"]);
        assert_eq!(fx.synth.calls.lock().as_slice(), ["hello there"]);
        assert!(!fx.transport.sent.lock().is_empty());
        let history = fx.controller.history();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_final_is_ignored() {
        let fx = fixture(no_cooldown(), vec![], vec![]);
        fx.controller
            .on_transcript(TranscriptEvent::final_("   "))
            .await;
        assert!(fx.generator.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_failure_speaks_fallback() {
        let mut fx = fixture(
            no_cooldown(),
            vec![Err(Error::Generation("upstream 500".into()))],
            vec![],
        );
        fx.controller
            .on_transcript(TranscriptEvent::final_("hello"))
            .await;

        assert_eq!(fx.events.recv().await, Some(PacerEvent::Completed));
        assert_eq!(
            fx.synth.calls.lock().as_slice(),
            [TurnConfig::default().fallback_utterance]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_utterance_not_reanswered() {
        let mut fx = fixture(no_cooldown(), vec![], vec![]);
        fx.controller
            .on_transcript(TranscriptEvent::final_("hello"))
            .await;
        assert_eq!(fx.events.recv().await, Some(PacerEvent::Completed));
        fx.controller.on_playback_complete();

        fx.controller
            .on_transcript(TranscriptEvent::final_("hello"))
            .await;
        assert_eq!(fx.generator.calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_gates_new_turns() {
        let mut fx = fixture(TurnConfig::default(), vec![], vec![]);
        fx.controller
            .on_transcript(TranscriptEvent::final_("hello"))
            .await;
        assert_eq!(fx.events.recv().await, Some(PacerEvent::Completed));
        fx.controller.on_playback_complete();

        // Inside the 250 ms window: ignored.
        fx.controller
            .on_transcript(TranscriptEvent::final_("are you there"))
            .await;
        assert_eq!(fx.generator.calls.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        fx.controller
            .on_transcript(TranscriptEvent::final_("are you there"))
            .await;
        assert_eq!(fx.generator.calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_utterance_supersedes_first() {
        // First synthesis is slow; a second final arrives meanwhile.
        let mut fx = fixture(no_cooldown(), vec![], vec![200, 0]);
        let controller = Arc::clone(&fx.controller);
        let first = tokio::spawn(async move {
            controller
                .on_transcript(TranscriptEvent::final_("first question"))
                .await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.controller
            .on_transcript(TranscriptEvent::final_("second question"))
            .await;
        first.await.unwrap();

        assert_eq!(fx.events.recv().await, Some(PacerEvent::Completed));
        // Both were synthesized, but only the second's audio played.
        assert_eq!(fx.synth.calls.lock().len(), 2);
        let second_marker = "reply to second question".len() as u8;
        assert_eq!(fx.transport.sent_markers(), vec![second_marker]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_playback_invalidates_in_flight_audio() {
        let mut fx = fixture(no_cooldown(), vec![], vec![100]);
        let controller = Arc::clone(&fx.controller);
        let turn = tokio::spawn(async move {
            controller
                .on_transcript(TranscriptEvent::final_("hello"))
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.controller.stop_playback().await;
        turn.await.unwrap();

        assert!(fx.transport.sent.lock().is_empty(), "stale audio must be dropped");
        assert!(!fx.controller.playback_active());
        assert!(fx.events.try_recv().is_err(), "no pacing run should have started");
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_utterance_answered_again() {
        let fx = fixture(no_cooldown(), vec![], vec![]);
        fx.controller
            .on_transcript(TranscriptEvent::final_("what is the price"))
            .await;
        assert!(fx.controller.playback_active());

        // Caller barges in mid-reply, then asks the same thing again.
        // Both the duplicate-utterance and repeated-reply checks must
        // forgive the interrupted exchange.
        assert!(fx.controller.stop_playback().await);
        fx.controller
            .on_transcript(TranscriptEvent::final_("what is the price"))
            .await;

        assert_eq!(fx.generator.calls.lock().len(), 2);
        assert_eq!(fx.synth.calls.lock().len(), 2);
        assert_eq!(fx.controller.history().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_spoken_once() {
        let config = TurnConfig {
            cooldown_ms: 0,
            greeting: Some("Hi, thanks for calling.".into()),
            ..TurnConfig::default()
        };
        let mut fx = fixture(config, vec![], vec![]);
        fx.controller.speak_greeting().await;
        assert_eq!(fx.events.recv().await, Some(PacerEvent::Completed));
        assert_eq!(fx.synth.calls.lock().as_slice(), ["Hi, thanks for calling."]);
        assert_eq!(fx.controller.history().len(), 1);
    }
}
