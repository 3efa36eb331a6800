//! Energy-based speech-activity estimation.
//!
//! Frames of 20 ms are classified voiced when their RMS energy clears a
//! fixed threshold. Crude next to a neural VAD, but cheap enough to run on
//! every chunk inline and accurate enough for endpointing telephone-band
//! speech.

use crate::normalise::SAMPLE_RATE;

/// Samples per 20 ms analysis frame at the canonical rate.
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * 20;

const FRAME_MS: u64 = 20;

/// Per-leg speech-activity estimator.
#[derive(Debug, Clone)]
pub struct SpeechActivity {
    /// RMS threshold on the i16 sample scale.
    threshold: f32,
}

impl Default for SpeechActivity {
    fn default() -> Self {
        Self { threshold: 250.0 }
    }
}

impl SpeechActivity {
    pub fn with_threshold(threshold: f32) -> Self {
        Self { threshold }
    }

    fn is_voiced(&self, frame: &[i16]) -> bool {
        if frame.is_empty() {
            return false;
        }
        let energy: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let rms = (energy / frame.len() as f64).sqrt();
        rms as f32 > self.threshold
    }

    /// Total voiced audio in the buffer, in milliseconds.
    pub fn voiced_ms(&self, pcm: &[i16]) -> u64 {
        pcm.chunks(FRAME_SAMPLES)
            .filter(|frame| self.is_voiced(frame))
            .count() as u64
            * FRAME_MS
    }

    /// Length of the unbroken silent run at the end of the buffer, in
    /// milliseconds.
    pub fn trailing_silence_ms(&self, pcm: &[i16]) -> u64 {
        let mut silent = 0u64;
        for frame in pcm.chunks(FRAME_SAMPLES).rev() {
            if self.is_voiced(frame) {
                break;
            }
            silent += FRAME_MS;
        }
        silent
    }
}
