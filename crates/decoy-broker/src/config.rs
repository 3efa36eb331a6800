//! Broker configuration.
//!
//! Embedded under `[broker]` in the server's TOML config; every field has a
//! serde default so a missing section means stock behaviour.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for session, relay, and pipeline behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Concurrent session cap; attaches beyond it are refused.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Bounded per-leg egress queue depth.
    #[serde(default = "default_egress_queue_capacity")]
    pub egress_queue_capacity: usize,

    /// How long a non-droppable envelope may block before the leg is
    /// declared a slow consumer.
    #[serde(default = "default_egress_block_timeout_ms")]
    pub egress_block_timeout_ms: u64,

    /// Server-initiated ping cadence.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Consecutive missed pongs before a leg is dropped.
    #[serde(default = "default_missed_pong_limit")]
    pub missed_pong_limit: u32,

    /// Grace window for a same-role reattach after a disconnect.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    /// Hard deadline for draining egress queues at teardown.
    #[serde(default = "default_drain_deadline_ms")]
    pub drain_deadline_ms: u64,

    /// Voiced audio that forces a transcription attempt.
    #[serde(default = "default_stt_window_seconds")]
    pub stt_window_seconds: f32,

    /// Trailing silence that finalises an utterance.
    #[serde(default = "default_endpoint_silence_ms")]
    pub endpoint_silence_ms: u64,

    /// Codec names accepted on ingress.
    #[serde(default = "default_codec_allowlist")]
    pub codec_allowlist: Vec<String>,

    /// Whether to append raw audio chunks to a per-call recording log.
    #[serde(default)]
    pub recording_enabled: bool,

    /// Directory for recording logs; required when recording is enabled.
    #[serde(default)]
    pub recording_dir: Option<PathBuf>,

    /// Transcript entries handed to the coaching lane as context.
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Per-session cap on concurrent intelligence extractions.
    #[serde(default = "default_intel_concurrency")]
    pub intel_concurrency: usize,

    /// Voice id handed to the TTS collaborator for coaching audio.
    #[serde(default = "default_coaching_voice")]
    pub coaching_voice: String,

    #[serde(default = "default_stt_timeout_ms")]
    pub stt_timeout_ms: u64,
    #[serde(default = "default_llm_extract_timeout_ms")]
    pub llm_extract_timeout_ms: u64,
    #[serde(default = "default_llm_coach_timeout_ms")]
    pub llm_coach_timeout_ms: u64,
    #[serde(default = "default_tts_timeout_ms")]
    pub tts_timeout_ms: u64,
    #[serde(default = "default_url_scan_timeout_ms")]
    pub url_scan_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        // serde defaults are the single source of truth.
        serde_json::from_str("{}").expect("empty broker config deserialises")
    }
}

impl BrokerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }

    pub fn egress_block_timeout(&self) -> Duration {
        Duration::from_millis(self.egress_block_timeout_ms)
    }

    pub fn stt_timeout(&self) -> Duration {
        Duration::from_millis(self.stt_timeout_ms)
    }

    pub fn llm_extract_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_extract_timeout_ms)
    }

    pub fn llm_coach_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_coach_timeout_ms)
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_millis(self.tts_timeout_ms)
    }

    pub fn url_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.url_scan_timeout_ms)
    }

    /// Transcriber tunables derived from the broker settings.
    pub fn transcriber_config(&self) -> decoy_audio::TranscriberConfig {
        decoy_audio::TranscriberConfig {
            window_ms: (self.stt_window_seconds * 1000.0) as u64,
            endpoint_silence_ms: self.endpoint_silence_ms,
            ..decoy_audio::TranscriberConfig::default()
        }
    }
}

fn default_max_sessions() -> usize {
    1024
}
fn default_egress_queue_capacity() -> usize {
    256
}
fn default_egress_block_timeout_ms() -> u64 {
    5000
}
fn default_ping_interval_ms() -> u64 {
    10_000
}
fn default_missed_pong_limit() -> u32 {
    3
}
fn default_drain_grace_ms() -> u64 {
    60_000
}
fn default_drain_deadline_ms() -> u64 {
    2000
}
fn default_stt_window_seconds() -> f32 {
    3.0
}
fn default_endpoint_silence_ms() -> u64 {
    800
}
fn default_codec_allowlist() -> Vec<String> {
    ["webm-opus", "ogg-opus", "wav-pcm", "mp3"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_context_window() -> usize {
    6
}
fn default_intel_concurrency() -> usize {
    4
}
fn default_coaching_voice() -> String {
    "coach".to_string()
}
fn default_stt_timeout_ms() -> u64 {
    8000
}
fn default_llm_extract_timeout_ms() -> u64 {
    6000
}
fn default_llm_coach_timeout_ms() -> u64 {
    6000
}
fn default_tts_timeout_ms() -> u64 {
    4000
}
fn default_url_scan_timeout_ms() -> u64 {
    10_000
}
