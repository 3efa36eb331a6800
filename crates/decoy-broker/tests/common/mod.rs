#![allow(dead_code)]

//! Shared helpers for the broker integration tests: a registry wired with
//! counting fakes, canned WAV audio, and envelope collection utilities.

use decoy_broker::collab::fakes::{
    MemoryPersistence, NullTts, ScriptedModel, ScriptedStt, StubScanner,
};
use decoy_broker::collab::Collaborators;
use decoy_broker::{egress_queue, BrokerConfig, CallRegistry, EgressQueue, EgressReceiver};
use decoy_types::{CallId, Envelope, Role};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Broker config tuned for fast tests: long ping cadence (out of the way),
/// short drain deadline.
pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.ping_interval_ms = 60_000;
    config.drain_grace_ms = 5_000;
    config.drain_deadline_ms = 300;
    config.egress_queue_capacity = 64;
    config
}

/// Handles on the individual fakes, for asserting call and side-effect
/// counts.
pub struct TestCollab {
    pub stt: Arc<ScriptedStt>,
    pub model: Arc<ScriptedModel>,
    pub tts: Arc<NullTts>,
    pub scanner: Arc<StubScanner>,
    pub persistence: Arc<MemoryPersistence>,
}

impl TestCollab {
    pub fn new(stt: ScriptedStt, model: ScriptedModel, scanner: StubScanner) -> (Self, Collaborators) {
        let stt = Arc::new(stt);
        let model = Arc::new(model);
        let tts = Arc::new(NullTts::default());
        let scanner = Arc::new(scanner);
        let persistence = Arc::new(MemoryPersistence::default());
        let collaborators = Collaborators {
            stt: stt.clone(),
            llm: model.clone(),
            tts: tts.clone(),
            scanner: scanner.clone(),
            persistence: persistence.clone(),
        };
        (
            Self {
                stt,
                model,
                tts,
                scanner,
                persistence,
            },
            collaborators,
        )
    }
}

pub fn registry_with(stt: ScriptedStt, config: BrokerConfig) -> (CallRegistry, TestCollab) {
    let (handles, collaborators) = TestCollab::new(stt, ScriptedModel::default(), StubScanner::default());
    (CallRegistry::new(config, collaborators), handles)
}

/// A leg pair for tests: the queue handed to the registry plus the
/// receiver a real server would drain into the socket.
pub fn leg(config: &BrokerConfig) -> (EgressQueue, EgressReceiver) {
    egress_queue(config.egress_queue_capacity, config.egress_block_timeout())
}

/// In-memory 16 kHz mono WAV of a loud square wave (always voiced).
pub fn voiced_wav(ms: usize) -> Vec<u8> {
    wav_of(square_samples(ms, 9000))
}

/// In-memory 16 kHz mono WAV of silence.
pub fn silent_wav(ms: usize) -> Vec<u8> {
    wav_of(vec![0i16; ms * 16])
}

fn square_samples(ms: usize, amplitude: i16) -> Vec<i16> {
    (0..ms * 16)
        .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
        .collect()
}

fn wav_of(samples: Vec<i16>) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

pub fn audio_envelope(payload: Vec<u8>) -> Envelope {
    Envelope::Audio {
        codec: "wav-pcm".to_string(),
        payload,
        seq: None,
        source: None,
    }
}

pub fn call_id(name: &str) -> CallId {
    CallId::from(name)
}

/// Receives envelopes until `pred` matches or the timeout lapses.
pub async fn recv_matching<F>(
    rx: &mut EgressReceiver,
    timeout: Duration,
    mut pred: F,
) -> Option<Envelope>
where
    F: FnMut(&Envelope) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Some(envelope) if pred(&envelope) => return Some(envelope),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Drains a receiver into a shared vector from a background task.
pub fn collect(mut rx: EgressReceiver) -> Arc<Mutex<Vec<Envelope>>> {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let writer = sink.clone();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            writer.lock().unwrap().push(envelope);
        }
    });
    sink
}

/// Discards everything a receiver produces.
pub fn drain(mut rx: EgressReceiver) {
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
}

/// Convenience: feed one leg `chunks` of voiced audio and give the
/// pipeline room to breathe between them.
pub async fn feed_voiced(
    handle: &decoy_broker::SessionHandle,
    role: Role,
    leg_id: u64,
    chunk_ms: usize,
    chunks: usize,
) {
    for _ in 0..chunks {
        handle
            .ingress(role, leg_id, audio_envelope(voiced_wav(chunk_ms)))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
