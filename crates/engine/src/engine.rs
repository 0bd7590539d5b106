//! Call registry and host entry points

use crate::error::EngineError;
use crate::session::CallSession;
use call_engine_config::Settings;
use call_engine_core::{
    AudioFormat, CallId, FrameDirection, OutboundAudio, SpeechSynthesizer, TextGenerator,
    Transcription, TranscriptEvent,
};
use call_engine_pipeline::{
    BargeInDetector, PacedSender, PacerEvent, TurnController, VoiceGate,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine for a fleet of concurrent calls.
///
/// All entry points take `&self`; per-call state is serialized by the
/// session's own locks and atomics, never by a global lock.
pub struct CallEngine {
    settings: Settings,
    transcription: Arc<dyn Transcription>,
    generator: Arc<dyn TextGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transport: Arc<dyn OutboundAudio>,
    calls: DashMap<CallId, Arc<CallSession>>,
}

impl CallEngine {
    pub fn new(
        settings: Settings,
        transcription: Arc<dyn Transcription>,
        generator: Arc<dyn TextGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transport: Arc<dyn OutboundAudio>,
    ) -> Self {
        Self {
            settings,
            transcription,
            generator,
            synthesizer,
            transport,
            calls: DashMap::new(),
        }
    }

    /// Bring up a new call: open the transcription session, wire the
    /// pipeline, spawn the per-call pump tasks, and speak the greeting
    /// if one is configured.
    pub async fn on_call_start(&self, call: CallId) -> Result<(), EngineError> {
        if self.calls.contains_key(&call) {
            warn!(call_id = %call, "duplicate call start");
            return Err(EngineError::DuplicateCall(call));
        }
        if self.calls.len() >= self.settings.engine.max_calls {
            warn!(call_id = %call, max = self.settings.engine.max_calls, "rejecting call, at capacity");
            return Err(EngineError::AtCapacity(self.settings.engine.max_calls));
        }

        let (stt, transcripts) = self
            .transcription
            .open(&call, AudioFormat::telephony())
            .await?;

        let (sender, pacer_events) = PacedSender::new(
            call.clone(),
            self.settings.pacer.clone(),
            Arc::clone(&self.transport),
        );
        let sender = Arc::new(sender);
        let turn = Arc::new(TurnController::new(
            call.clone(),
            self.settings.turn.clone(),
            self.settings.engine.history_limit,
            Arc::clone(&self.generator),
            Arc::clone(&self.synthesizer),
            Arc::clone(&self.transport),
            Arc::clone(&sender),
        ));

        let session = Arc::new(CallSession::new(
            call.clone(),
            VoiceGate::new(self.settings.vad.clone()),
            BargeInDetector::new(self.settings.barge_in.clone()),
            stt,
            sender,
            Arc::clone(&turn),
        ));
        session.retain_task(tokio::spawn(pump_transcripts(
            Arc::clone(&turn),
            transcripts,
            call.clone(),
        )));
        session.retain_task(tokio::spawn(pump_pacer_events(
            Arc::clone(&turn),
            pacer_events,
            call.clone(),
        )));

        match self.calls.entry(call.clone()) {
            Entry::Occupied(_) => {
                // Lost a start/start race; undo our half-built session.
                session.teardown();
                warn!(call_id = %call, "duplicate call start");
                return Err(EngineError::DuplicateCall(call));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
            }
        }

        counter!("call_engine_calls_started_total").increment(1);
        gauge!("call_engine_active_calls").set(self.calls.len() as f64);
        info!(call_id = %call, "call started");

        session.retain_task(tokio::spawn(async move {
            turn.speak_greeting().await;
        }));
        Ok(())
    }

    /// Feed one audio frame from the signaling transport. Outbound
    /// echoes and empty frames are ignored; frames for unknown calls
    /// are rejected without creating state.
    pub async fn on_inbound_frame(
        &self,
        call: &CallId,
        frame: &[u8],
        direction: FrameDirection,
    ) -> Result<(), EngineError> {
        let session = match self.calls.get(call) {
            Some(session) => Arc::clone(&session),
            None => {
                warn!(call_id = %call, "frame for unknown call");
                return Err(EngineError::UnknownCall(call.clone()));
            }
        };
        if direction != FrameDirection::Inbound || frame.is_empty() {
            return Ok(());
        }
        session.process_frame(frame).await;
        Ok(())
    }

    /// Tear the call down. Idempotent: the session is removed exactly
    /// once, and a second end event is a no-op.
    pub async fn on_call_end(&self, call: &CallId) -> Result<(), EngineError> {
        match self.calls.remove(call) {
            Some((_, session)) => {
                session.teardown();
                counter!("call_engine_calls_ended_total").increment(1);
                gauge!("call_engine_active_calls").set(self.calls.len() as f64);
                info!(call_id = %call, "call ended");
            }
            None => {
                debug!(call_id = %call, "end for unknown or already ended call");
            }
        }
        Ok(())
    }

    /// The media transport reconnected mid-call: ambient conditions may
    /// have changed, so VAD adaptation restarts while the conversation
    /// continues.
    pub fn on_transport_reconnect(&self, call: &CallId) -> Result<(), EngineError> {
        let session = self
            .calls
            .get(call)
            .ok_or_else(|| EngineError::UnknownCall(call.clone()))?;
        session.reset_vad();
        info!(call_id = %call, "transport reconnected, vad reset");
        Ok(())
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn is_active(&self, call: &CallId) -> bool {
        self.calls.contains_key(call)
    }

    /// Whether synthesized audio is currently playing on the call.
    pub fn playback_active(&self, call: &CallId) -> bool {
        self.calls
            .get(call)
            .map(|session| session.turn().playback_active())
            .unwrap_or(false)
    }
}

/// Deliver transcript events to the turn controller. Partials are
/// applied inline; finals run on their own task so a slow collaborator
/// never backs the transcript stream up behind an active turn.
async fn pump_transcripts(
    turn: Arc<TurnController>,
    mut transcripts: mpsc::Receiver<TranscriptEvent>,
    call: CallId,
) {
    while let Some(event) = transcripts.recv().await {
        if event.is_final {
            let turn = Arc::clone(&turn);
            tokio::spawn(async move {
                turn.on_transcript(event).await;
            });
        } else {
            turn.on_transcript(event).await;
        }
    }
    debug!(call_id = %call, "transcript stream ended");
}

/// Map pacer run outcomes back onto the turn state.
async fn pump_pacer_events(
    turn: Arc<TurnController>,
    mut events: mpsc::UnboundedReceiver<PacerEvent>,
    call: CallId,
) {
    while let Some(event) = events.recv().await {
        match event {
            PacerEvent::Completed => {
                turn.on_playback_complete();
            }
            PacerEvent::Stopped => {
                // Whoever stopped the sender already updated the turn.
            }
            PacerEvent::TransportClosed => {
                warn!(call_id = %call, "outbound transport closed mid-playback");
                turn.on_playback_complete();
            }
        }
    }
}
