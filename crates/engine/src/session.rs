//! Per-call session state
//!
//! One [`CallSession`] per live call, owned by the engine's registry
//! and removed exactly once at teardown. The frame path (VAD, STT
//! feed, barge-in) runs here; turn work runs on the controller.

use call_engine_core::{CallId, TranscriptionSession};
use call_engine_pipeline::{BargeInDetector, PacedSender, TurnController, VoiceGate};
use metrics::counter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// How often the frame path emits a trace log, in frames (250 = 5 s).
const FRAME_LOG_EVERY: u64 = 250;

pub struct CallSession {
    id: CallId,
    vad: Mutex<VoiceGate>,
    barge: Mutex<BargeInDetector>,
    stt: Box<dyn TranscriptionSession>,
    sender: Arc<PacedSender>,
    turn: Arc<TurnController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    frames_seen: AtomicU64,
}

impl CallSession {
    pub fn new(
        id: CallId,
        vad: VoiceGate,
        barge: BargeInDetector,
        stt: Box<dyn TranscriptionSession>,
        sender: Arc<PacedSender>,
        turn: Arc<TurnController>,
    ) -> Self {
        Self {
            id,
            vad: Mutex::new(vad),
            barge: Mutex::new(barge),
            stt,
            sender,
            turn,
            tasks: Mutex::new(Vec::new()),
            frames_seen: AtomicU64::new(0),
        }
    }

    pub fn turn(&self) -> &Arc<TurnController> {
        &self.turn
    }

    /// Retain a per-call task handle for teardown.
    pub fn retain_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Inbound frame path: VAD, STT feed, barge-in arbitration. Never
    /// awaits a collaborator; a pending turn does not block it.
    pub async fn process_frame(&self, frame: &[u8]) {
        let seq = self.frames_seen.fetch_add(1, Ordering::Relaxed);
        let decision = self.vad.lock().process(frame);

        if let Err(err) = self.stt.send_audio(frame) {
            if seq % FRAME_LOG_EVERY == 0 {
                debug!(call_id = %self.id, error = %err, "transcription feed failing");
            }
        }

        let fired = self.barge.lock().observe(
            decision.is_open,
            decision.rms,
            self.turn.playback_active(),
        );
        if fired {
            info!(call_id = %self.id, rms = decision.rms, "caller barge-in, stopping playback");
            counter!("call_engine_barge_ins_total").increment(1);
            self.turn.stop_playback().await;
        }

        if seq % FRAME_LOG_EVERY == 0 {
            trace!(
                call_id = %self.id,
                seq,
                rms = decision.rms,
                snr_db = decision.snr_db,
                vad_open = decision.is_open,
                "frame path"
            );
        }
    }

    /// Clear VAD state after a media transport reconnect; the logical
    /// call and its conversation survive.
    pub fn reset_vad(&self) {
        self.vad.lock().reset();
        self.barge.lock().reset();
    }

    /// Stop everything this call owns. Runs exactly once, driven by
    /// the registry removing the session.
    pub fn teardown(&self) {
        self.turn.shutdown();
        self.sender.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.stt.close();
        debug!(call_id = %self.id, "session torn down");
    }
}
