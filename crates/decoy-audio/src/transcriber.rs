//! Per-leg rolling buffer that decides when to hand a window to the
//! transcription collaborator.
//!
//! `ingest` is a plain append and never blocks the audio relay path. The
//! owner polls after each ingest; a window comes back when either the
//! minimum utterance length has accumulated or endpointing detects the end
//! of an utterance.

use crate::normalise::SAMPLE_RATE;
use crate::vad::SpeechActivity;

const SAMPLES_PER_MS: u64 = SAMPLE_RATE as u64 / 1000;

/// Tunables for the windowing decisions. Defaults match the broker
/// configuration defaults.
#[derive(Debug, Clone)]
pub struct TranscriberConfig {
    /// Voiced audio that forces a transcription attempt.
    pub window_ms: u64,
    /// Trailing silence that finalises an utterance.
    pub endpoint_silence_ms: u64,
    /// Minimum voiced audio for endpointing to fire at all.
    pub min_voiced_ms: u64,
    /// Buffer length at which the below-threshold check applies.
    pub discard_window_ms: u64,
    /// Voiced floor under which a full discard window is thrown away.
    pub discard_voiced_ms: u64,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            window_ms: 3000,
            endpoint_silence_ms: 800,
            min_voiced_ms: 500,
            discard_window_ms: 5000,
            discard_voiced_ms: 300,
        }
    }
}

/// Why a window was finalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Enough voiced audio accumulated.
    WindowFull,
    /// Trailing silence after speech.
    Endpoint,
}

/// One finalised utterance window, ready for the STT collaborator.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub pcm: Vec<i16>,
    /// Offset of the first sample, in ms since the leg started ingesting.
    pub start_ms: u64,
    /// Offset just past the last sample.
    pub end_ms: u64,
    pub trigger: Trigger,
}

/// Append-only PCM buffer plus speech-activity state for one leg.
#[derive(Debug)]
pub struct TranscriptBuffer {
    cfg: TranscriberConfig,
    vad: SpeechActivity,
    pcm: Vec<i16>,
    /// Samples consumed (or discarded) before the current buffer start.
    consumed_samples: u64,
}

impl TranscriptBuffer {
    pub fn new(cfg: TranscriberConfig) -> Self {
        Self {
            cfg,
            vad: SpeechActivity::default(),
            pcm: Vec::new(),
            consumed_samples: 0,
        }
    }

    /// Appends normalised PCM. O(1) amortised; never blocks.
    pub fn ingest(&mut self, samples: &[i16]) {
        self.pcm.extend_from_slice(samples);
    }

    pub fn buffered_ms(&self) -> u64 {
        self.pcm.len() as u64 / SAMPLES_PER_MS
    }

    /// Checks the trigger conditions and takes a window when one fires.
    ///
    /// Endpoint triggers keep any audio accumulated after the endpoint in
    /// the buffer; below-threshold buffers are discarded wholesale so that
    /// silence never reaches the STT collaborator.
    pub fn poll(&mut self) -> Option<Utterance> {
        let voiced = self.vad.voiced_ms(&self.pcm);

        if voiced >= self.cfg.window_ms {
            return Some(self.take_window(self.pcm.len(), Trigger::WindowFull));
        }

        let trailing = self.vad.trailing_silence_ms(&self.pcm);
        if trailing >= self.cfg.endpoint_silence_ms && voiced >= self.cfg.min_voiced_ms {
            // Cut at the endpoint, keeping one endpoint-length of silence in
            // the window for STT context; the rest stays buffered.
            let keep_silence = (self.cfg.endpoint_silence_ms * SAMPLES_PER_MS) as usize;
            let trailing_samples = (trailing * SAMPLES_PER_MS) as usize;
            let cut = self.pcm.len() - trailing_samples + keep_silence.min(trailing_samples);
            return Some(self.take_window(cut, Trigger::Endpoint));
        }

        if self.buffered_ms() >= self.cfg.discard_window_ms && voiced < self.cfg.discard_voiced_ms {
            self.consumed_samples += self.pcm.len() as u64;
            self.pcm.clear();
        }
        None
    }

    fn take_window(&mut self, cut: usize, trigger: Trigger) -> Utterance {
        let start_ms = self.consumed_samples / SAMPLES_PER_MS;
        let window: Vec<i16> = self.pcm.drain(..cut).collect();
        self.consumed_samples += window.len() as u64;
        let end_ms = self.consumed_samples / SAMPLES_PER_MS;
        Utterance {
            pcm: window,
            start_ms,
            end_ms,
            trigger,
        }
    }
}
