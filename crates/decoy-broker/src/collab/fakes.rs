//! Deterministic in-memory collaborator implementations.
//!
//! Used by the test suites and by the server's loopback mode when no real
//! engines are wired in. Each fake counts its calls so cancellation tests
//! can assert that no side effect survived teardown.

use super::{
    Coaching, CollabError, LanguageModel, Persistence, SpeechToText, TextToSpeech, Transcription,
    UrlScanner, UrlVerdict,
};
use async_trait::async_trait;
use decoy_types::{CallId, IntelligenceSnapshot, Strategy, TranscriptEntry};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// STT fake fed from a script of responses.
///
/// When the script runs dry the fallback is returned; `silent` yields empty
/// text, which the broker treats as nothing-to-transcribe.
#[derive(Debug, Default)]
pub struct ScriptedStt {
    script: Mutex<VecDeque<Result<Transcription, CollabError>>>,
    fallback: Option<Transcription>,
    pub calls: AtomicUsize,
    pub completed: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedStt {
    /// Every window transcribes to the same text.
    pub fn always(text: &str) -> Self {
        Self {
            fallback: Some(Transcription {
                text: text.to_string(),
                language: "en".to_string(),
                confidence: 0.92,
            }),
            ..Default::default()
        }
    }

    /// Windows transcribe to empty text (dropped by the broker).
    pub fn silent() -> Self {
        Self {
            fallback: Some(Transcription {
                text: String::new(),
                language: "en".to_string(),
                confidence: 0.0,
            }),
            ..Default::default()
        }
    }

    /// Every call fails with a transient error.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<Transcription, CollabError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that ran to completion (i.e. were not cancelled mid-flight).
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(
        &self,
        _pcm: &[i16],
        _language_hint: Option<&str>,
    ) -> Result<Transcription, CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        let result = match scripted {
            Some(r) => r,
            None => match &self.fallback {
                Some(t) => Ok(t.clone()),
                None => Err(CollabError::Transient("stt backend unavailable".to_string())),
            },
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Language-model fake with scriptable extraction output and a fixed
/// coaching response.
#[derive(Debug)]
pub struct ScriptedModel {
    extractions: Mutex<VecDeque<Result<serde_json::Value, CollabError>>>,
    coaching: Mutex<VecDeque<Result<Coaching, CollabError>>>,
    pub extract_calls: AtomicUsize,
    pub coach_calls: AtomicUsize,
    coach_delay: Option<Duration>,
    extract_delay: Option<Duration>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            extractions: Mutex::new(VecDeque::new()),
            coaching: Mutex::new(VecDeque::new()),
            extract_calls: AtomicUsize::new(0),
            coach_calls: AtomicUsize::new(0),
            coach_delay: None,
            extract_delay: None,
        }
    }
}

impl ScriptedModel {
    pub fn push_extraction(&self, value: Result<serde_json::Value, CollabError>) {
        self.extractions.lock().unwrap().push_back(value);
    }

    pub fn push_coaching(&self, value: Result<Coaching, CollabError>) {
        self.coaching.lock().unwrap().push_back(value);
    }

    pub fn with_coach_delay(mut self, delay: Duration) -> Self {
        self.coach_delay = Some(delay);
        self
    }

    pub fn with_extract_delay(mut self, delay: Duration) -> Self {
        self.extract_delay = Some(delay);
        self
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn extract_entities(&self, _text: &str) -> Result<serde_json::Value, CollabError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.extract_delay {
            tokio::time::sleep(delay).await;
        }
        self.extractions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(serde_json::json!({})))
    }

    async fn coach(
        &self,
        context: &[TranscriptEntry],
        snapshot: &IntelligenceSnapshot,
    ) -> Result<Coaching, CollabError> {
        self.coach_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.coach_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(scripted) = self.coaching.lock().unwrap().pop_front() {
            return scripted;
        }
        // Default heuristic: a credential demand in the recent context (or
        // an already-high threat score) leans toward stalling for
        // intelligence, anything else toward empathy.
        let credential_demand = context.iter().any(|e| {
            let lowered = e.text.to_lowercase();
            lowered.contains("otp") || lowered.contains("password") || lowered.contains("pin")
        });
        let strategy = if credential_demand || snapshot.threat_score >= 0.5 {
            Strategy::Delay
        } else {
            Strategy::Empathy
        };
        let intent = if credential_demand {
            "credential_harvest".to_string()
        } else {
            "unknown".to_string()
        };
        Ok(Coaching {
            text: "Ask them to repeat the request and note every detail.".to_string(),
            strategy,
            intent,
        })
    }
}

/// TTS fake returning a tiny fixed MP3-tagged payload.
#[derive(Debug, Default)]
pub struct NullTts {
    pub calls: AtomicUsize,
    fail: bool,
}

impl NullTts {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }
}

#[async_trait]
impl TextToSpeech for NullTts {
    async fn synthesize(
        &self,
        _text: &str,
        _voice_id: &str,
    ) -> Result<(Vec<u8>, String), CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CollabError::Transient("tts backend unavailable".to_string()));
        }
        Ok((vec![0xff, 0xfb, 0x90, 0x00], "mp3".to_string()))
    }
}

/// URL scanner fake with per-URL verdicts and an optional delay, for
/// exercising the out-of-band verdict race.
#[derive(Debug, Default)]
pub struct StubScanner {
    verdicts: Mutex<HashMap<String, UrlVerdict>>,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
    pub completed: AtomicUsize,
}

impl StubScanner {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn flag_malicious(&self, url: &str) {
        self.verdicts.lock().unwrap().insert(
            url.to_string(),
            UrlVerdict {
                is_safe: false,
                risk_score: 0.97,
                labels: vec!["malware".to_string()],
            },
        );
    }
}

#[async_trait]
impl UrlScanner for StubScanner {
    async fn check(&self, url: &str) -> Result<UrlVerdict, CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let verdict = self
            .verdicts
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(UrlVerdict {
                is_safe: true,
                risk_score: 0.05,
                labels: Vec::new(),
            });
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(verdict)
    }
}

/// In-memory persistence with side-effect counters.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    pub transcripts: Mutex<Vec<(CallId, TranscriptEntry)>>,
    pub snapshots: Mutex<Vec<(CallId, IntelligenceSnapshot)>>,
    pub writes: AtomicUsize,
}

impl MemoryPersistence {
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn append_transcript(
        &self,
        call_id: &CallId,
        entry: &TranscriptEntry,
    ) -> Result<(), CollabError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.transcripts
            .lock()
            .unwrap()
            .push((call_id.clone(), entry.clone()));
        Ok(())
    }

    async fn update_intelligence(
        &self,
        call_id: &CallId,
        snapshot: &IntelligenceSnapshot,
    ) -> Result<(), CollabError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.snapshots
            .lock()
            .unwrap()
            .push((call_id.clone(), snapshot.clone()));
        Ok(())
    }
}
