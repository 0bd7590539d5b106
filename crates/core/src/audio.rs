//! Telephony audio utilities
//!
//! Inbound call audio arrives as 8 kHz μ-law, one byte per sample, in
//! fixed 20 ms frames (160 bytes). Everything here is pure and stateless;
//! the decode table is built once at startup.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Maximum linear magnitude representable by a decoded μ-law sample.
const MULAW_MAX: f32 = 32768.0;

/// μ-law byte → 16-bit linear PCM, per the G.711 companding law.
static MULAW_TABLE: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let u = !(i as u8);
        let mut t = (((u & 0x0f) as i32) << 3) + 0x84;
        t <<= (u & 0x70) >> 4;
        *slot = if u & 0x80 != 0 { (0x84 - t) as i16 } else { (t - 0x84) as i16 };
    }
    table
});

/// Decode a single μ-law byte to a linear PCM sample.
#[inline]
pub fn mulaw_to_linear(byte: u8) -> i16 {
    MULAW_TABLE[byte as usize]
}

/// Root-mean-square amplitude of a μ-law frame, normalized to [0, 1].
///
/// A zero-length frame yields 0.0.
pub fn mulaw_rms(frame: &[u8]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let mut acc = 0.0f64;
    for &byte in frame {
        let s = MULAW_TABLE[byte as usize] as f64;
        acc += s * s;
    }
    ((acc / frame.len() as f64).sqrt() / MULAW_MAX as f64) as f32
}

/// Direction marker delivered with each frame by the signaling transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDirection {
    /// Audio from the caller
    Inbound,
    /// Audio we sent, echoed back by the transport
    Outbound,
}

/// Audio format of a call's media streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Frame duration in milliseconds
    pub frame_ms: u32,
}

impl AudioFormat {
    /// Standard telephony format: 8 kHz μ-law, 20 ms frames.
    pub fn telephony() -> Self {
        Self {
            sample_rate: 8000,
            frame_ms: 20,
        }
    }

    /// Bytes per frame at one byte per sample.
    pub fn frame_bytes(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}
