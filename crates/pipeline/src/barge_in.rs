//! Barge-in arbitration
//!
//! The voice gate's hysteresis is tuned for clean turn detection and is
//! deliberately slow to open; a caller interrupting playback needs a
//! faster circuit-breaker. The arbiter fires on a short streak of
//! frames where either the gate is open or the raw frame RMS clears a
//! coarse threshold, and is dormant whenever nothing is playing.

use serde::{Deserialize, Serialize};

/// Barge-in tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Raw RMS level that counts as interruption even before the voice
    /// gate confirms speech.
    pub rms_threshold: f32,
    /// Consecutive triggering frames required to fire (3 ≈ 60 ms).
    pub streak_frames: u32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            rms_threshold: 0.05,
            streak_frames: 3,
        }
    }
}

/// Per-call barge-in detector. Owned by the call's frame path.
#[derive(Debug)]
pub struct BargeInDetector {
    config: BargeInConfig,
    streak: u32,
}

impl BargeInDetector {
    pub fn new(config: BargeInConfig) -> Self {
        Self { config, streak: 0 }
    }

    /// Feed one frame's VAD verdict and raw RMS. Returns `true` exactly
    /// when an interruption should fire; the streak resets so the next
    /// interruption requires a fresh streak.
    pub fn observe(&mut self, vad_open: bool, rms: f32, playback_active: bool) -> bool {
        if !playback_active {
            self.streak = 0;
            return false;
        }
        if vad_open || rms >= self.config.rms_threshold {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        if self.streak >= self.config.streak_frames {
            self.streak = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }
}
