//! Error types for the audio pipeline.

use decoy_types::UnsupportedCodecError;

/// Errors that can occur while normalising or buffering audio.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// The chunk named a codec outside the recognised set.
    #[error(transparent)]
    UnsupportedCodec(#[from] UnsupportedCodecError),

    /// The payload was empty or truncated below a decodable unit.
    #[error("empty audio payload")]
    EmptyPayload,

    /// The container or bitstream could not be decoded.
    #[error("audio decode error ({codec}): {detail}")]
    Decode { codec: &'static str, detail: String },

    /// Resampling to the canonical rate failed.
    #[error("resample error: {0}")]
    Resample(String),

    /// A recording log frame was truncated or corrupt.
    #[error("recording log error: {0}")]
    RecordingLog(String),
}
