//! Voice activity detection
//!
//! Energy-based gate with hysteresis and an adaptive noise floor. Pure
//! absolute thresholds misfire on variable line noise, so frames are
//! judged by SNR against a slowly tracking floor, with absolute floors
//! guarding against hiss opening the gate when the floor estimate is
//! artificially low. Opening requires a streak of qualifying frames;
//! closing waits out a hang window, so the gate does not flutter at the
//! boundary. During the first ~1.2 s of a call the floor has not
//! converged yet, so a relaxed absolute threshold alone may open the
//! gate.

use call_engine_core::mulaw_rms;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Seed for the adaptive noise floor before any quiet frame is seen.
const NOISE_FLOOR_SEED: f32 = 0.003;
/// Lower clamp for the noise floor estimate.
const NOISE_FLOOR_MIN: f32 = 1e-5;
/// Added to RMS before the log so silence yields a finite SNR.
const RMS_EPSILON: f32 = 1e-6;
/// EMA weights for the noise floor, tracking slowly on quiet frames only.
const NOISE_EMA_KEEP: f32 = 0.94;
const NOISE_EMA_MIX: f32 = 0.06;

/// Voice gate tunables. All thresholds are independent knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Consecutive qualifying frames required to open (10 ≈ 200 ms).
    pub min_open_frames: u32,
    /// Frames of trailing grace before the gate closes.
    pub hang_frames: u32,
    /// SNR threshold (dB) for a frame to count toward opening.
    pub snr_open_db: f32,
    /// SNR threshold (dB) below which a frame counts toward closing.
    pub snr_close_db: f32,
    /// Absolute RMS floor for opening.
    pub abs_rms_open: f32,
    /// Absolute RMS floor below which a frame counts toward closing.
    pub abs_rms_close: f32,
    /// Window after call start in which a single hot frame may open
    /// the gate outright, tolerating an uncalibrated noise floor.
    pub boot_grace_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            min_open_frames: 10,
            hang_frames: 10,
            snr_open_db: 10.0,
            snr_close_db: 7.0,
            abs_rms_open: 0.025,
            abs_rms_close: 0.015,
            boot_grace_ms: 1200,
        }
    }
}

/// Per-frame gate decision plus diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub is_open: bool,
    pub rms: f32,
    pub snr_db: f32,
}

/// Hysteresis voice gate for one call.
///
/// Owned exclusively by the call; not internally synchronized. Frames
/// must be fed in arrival order.
#[derive(Debug)]
pub struct VoiceGate {
    config: VadConfig,
    started_at: Instant,
    open: bool,
    open_streak: u32,
    hang: u32,
    noise_floor: f32,
}

impl VoiceGate {
    pub fn new(config: VadConfig) -> Self {
        Self::with_start(config, Instant::now())
    }

    /// Construct with an explicit call-start instant, for tests that
    /// drive the boot-grace window deterministically.
    pub fn with_start(config: VadConfig, started_at: Instant) -> Self {
        Self {
            config,
            started_at,
            open: false,
            open_streak: 0,
            hang: 0,
            noise_floor: NOISE_FLOOR_SEED,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// Clear all adaptive state, keeping the configuration. Used when
    /// the media transport reconnects mid-call; the boot-grace window
    /// restarts with it.
    pub fn reset(&mut self) {
        self.started_at = Instant::now();
        self.open = false;
        self.open_streak = 0;
        self.hang = 0;
        self.noise_floor = NOISE_FLOOR_SEED;
    }

    /// Feed one inbound frame.
    pub fn process(&mut self, frame: &[u8]) -> VadDecision {
        self.process_at(frame, Instant::now())
    }

    /// Feed one inbound frame with an explicit clock, for deterministic
    /// tests.
    pub fn process_at(&mut self, frame: &[u8], now: Instant) -> VadDecision {
        let rms = mulaw_rms(frame);

        // Track ambient noise only on quiet frames while closed, so the
        // caller's own voice never pollutes the estimate.
        if !self.open && rms < self.config.abs_rms_open {
            let sample = rms.max(NOISE_FLOOR_MIN);
            self.noise_floor =
                (NOISE_EMA_KEEP * self.noise_floor + NOISE_EMA_MIX * sample).max(NOISE_FLOOR_MIN);
        }

        let snr_db = 20.0 * ((rms + RMS_EPSILON) / self.noise_floor.max(NOISE_FLOOR_MIN)).log10();

        let open_cond = rms >= self.config.abs_rms_open && snr_db >= self.config.snr_open_db;
        let close_cond = rms < self.config.abs_rms_close || snr_db < self.config.snr_close_db;
        let in_boot = now.saturating_duration_since(self.started_at)
            <= Duration::from_millis(self.config.boot_grace_ms);
        let boot_open_cond = in_boot && rms >= (0.8 * self.config.abs_rms_open).max(0.02);

        if !self.open {
            if boot_open_cond {
                self.open = true;
                self.open_streak = 0;
                self.hang = self.config.hang_frames;
                debug!(rms, snr_db, "voice gate opened in boot grace");
            } else if open_cond {
                self.open_streak = (self.open_streak + 1).min(self.config.min_open_frames);
                if self.open_streak >= self.config.min_open_frames {
                    self.open = true;
                    self.hang = self.config.hang_frames;
                    debug!(rms, snr_db, "voice gate opened");
                }
            } else {
                self.open_streak = 0;
            }
        } else if close_cond {
            self.hang = self.hang.saturating_sub(1);
            if self.hang == 0 {
                self.open = false;
                self.open_streak = 0;
                debug!(rms, snr_db, "voice gate closed");
            }
        } else {
            // Continued voice renews the closing grace.
            self.hang = self.config.hang_frames;
        }

        VadDecision {
            is_open: self.open,
            rms,
            snr_db,
        }
    }
}
