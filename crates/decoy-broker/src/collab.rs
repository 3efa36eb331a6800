//! Collaborator interfaces.
//!
//! The broker consumes every external capability through these narrow
//! traits, injected into the registry and passed down to each session. No
//! process-global singletons: tests plug in the in-memory [`fakes`], an
//! outer layer plugs in real engines.

use async_trait::async_trait;
use decoy_types::{CallId, IntelligenceSnapshot, TranscriptEntry};
use std::sync::Arc;

pub mod fakes;

/// Collaborator call failures, classified for retry policy.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    /// Timeouts, 5xx-class failures: retried once with fresh input.
    #[error("transient collaborator failure: {0}")]
    Transient(String),

    /// Schema or authentication failures: the lane is disabled for the
    /// remainder of the session.
    #[error("fatal collaborator failure: {0}")]
    Fatal(String),
}

/// One finished transcription.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub language: String,
    pub confidence: f32,
}

/// Coaching output before TTS.
#[derive(Debug, Clone)]
pub struct Coaching {
    pub text: String,
    pub strategy: decoy_types::Strategy,
    pub intent: String,
}

/// Reputation verdict for one URL.
#[derive(Debug, Clone)]
pub struct UrlVerdict {
    pub is_safe: bool,
    pub risk_score: f32,
    pub labels: Vec<String>,
}

/// Streaming speech-to-text over canonical PCM windows.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        pcm: &[i16],
        language_hint: Option<&str>,
    ) -> Result<Transcription, CollabError>;
}

/// The language-model agent behind both analysis lanes.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Entity extraction; the returned JSON is schema-validated by the
    /// caller and discarded when invalid.
    async fn extract_entities(&self, text: &str) -> Result<serde_json::Value, CollabError>;

    /// Coaching over the recent context window, most recent entry first.
    async fn coach(
        &self,
        context: &[TranscriptEntry],
        snapshot: &IntelligenceSnapshot,
    ) -> Result<Coaching, CollabError>;
}

/// Speech synthesis for coaching utterances.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Returns encoded audio and its codec tag; the broker passes the
    /// bytes through unchanged.
    async fn synthesize(&self, text: &str, voice_id: &str)
        -> Result<(Vec<u8>, String), CollabError>;
}

/// Asynchronous URL reputation probe; fire-and-forget from the hot path.
#[async_trait]
pub trait UrlScanner: Send + Sync {
    async fn check(&self, url: &str) -> Result<UrlVerdict, CollabError>;
}

/// Best-effort session history sink. Failures are logged, never surfaced.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn append_transcript(
        &self,
        call_id: &CallId,
        entry: &TranscriptEntry,
    ) -> Result<(), CollabError>;

    async fn update_intelligence(
        &self,
        call_id: &CallId,
        snapshot: &IntelligenceSnapshot,
    ) -> Result<(), CollabError>;
}

/// The full collaborator set a registry is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
    pub scanner: Arc<dyn UrlScanner>,
    pub persistence: Arc<dyn Persistence>,
}

impl Collaborators {
    /// Loopback wiring: deterministic in-memory fakes for development and
    /// tests.
    pub fn loopback() -> Self {
        Self {
            stt: Arc::new(fakes::ScriptedStt::silent()),
            llm: Arc::new(fakes::ScriptedModel::default()),
            tts: Arc::new(fakes::NullTts::default()),
            scanner: Arc::new(fakes::StubScanner::default()),
            persistence: Arc::new(fakes::MemoryPersistence::default()),
        }
    }
}
