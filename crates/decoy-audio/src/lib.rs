//! Audio pipeline for the decoy call broker.
//!
//! Decodes inbound codec-framed chunks to the canonical representation
//! (16 kHz, mono, 16-bit little-endian PCM), estimates speech activity, and
//! accumulates per-leg rolling buffers that decide when enough speech has
//! been captured to hand a window to the transcription collaborator.
//!
//! All of this crate is synchronous CPU work; callers off-load it to a
//! blocking pool when a chunk is expensive to decode.

pub mod error;
pub mod normalise;
pub mod recording;
pub mod transcriber;
pub mod vad;
mod webm;

pub use error::AudioError;
pub use normalise::{normalise, pcm_to_le_bytes, SAMPLE_RATE};
pub use transcriber::{TranscriberConfig, TranscriptBuffer, Trigger, Utterance};
pub use vad::SpeechActivity;
