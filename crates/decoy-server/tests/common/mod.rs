#![allow(dead_code)]

//! Shared helpers for the end-to-end WebSocket tests: a server on an
//! ephemeral port, envelope-speaking clients, and canned WAV audio.

use decoy_broker::collab::fakes::{
    MemoryPersistence, NullTts, ScriptedModel, ScriptedStt, StubScanner,
};
use decoy_broker::collab::Collaborators;
use decoy_broker::{BrokerConfig, CallRegistry};
use decoy_server::{app, AppState};
use decoy_types::Envelope;
use futures_util::{SinkExt, StreamExt};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Counting handles on the fakes wired into the server under test.
pub struct TestCollab {
    pub stt: Arc<ScriptedStt>,
    pub model: Arc<ScriptedModel>,
    pub tts: Arc<NullTts>,
    pub scanner: Arc<StubScanner>,
    pub persistence: Arc<MemoryPersistence>,
}

pub fn collab_with(
    stt: ScriptedStt,
    model: ScriptedModel,
    scanner: StubScanner,
) -> (TestCollab, Collaborators) {
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
        TestCollab {
            stt,
            model,
            tts,
            scanner,
            persistence,
        },
        collaborators,
    )
}

/// Broker config tuned for fast tests.
pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.ping_interval_ms = 60_000;
    config.drain_grace_ms = 5_000;
    config.drain_deadline_ms = 300;
    config
}

/// Spawns the server on an ephemeral port and returns its address.
pub async fn spawn_app(config: BrokerConfig, collaborators: Collaborators) -> SocketAddr {
    let registry = CallRegistry::new(config, collaborators);
    let router = app(AppState { registry });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Connects one leg over a real WebSocket.
pub async fn ws_connect(addr: SocketAddr, call_id: &str, role: &str) -> Ws {
    let url = format!("ws://{addr}/api/call/connect?call_id={call_id}&role={role}");
    let (ws, _) = connect_async(url).await.expect("websocket connect failed");
    ws
}

pub async fn send_envelope(ws: &mut Ws, envelope: &Envelope) {
    ws.send(WsMessage::Text(envelope.to_frame()))
        .await
        .expect("websocket send failed");
}

/// Reads envelopes until one matches or the timeout lapses.
pub async fn recv_matching<F>(ws: &mut Ws, timeout: Duration, mut pred: F) -> Option<Envelope>
where
    F: FnMut(&Envelope) -> bool,
{
    tokio::time::timeout(timeout, async {
        while let Some(Ok(message)) = ws.next().await {
            if let WsMessage::Text(frame) = message {
                if let Ok(envelope) = Envelope::parse(&frame) {
                    if pred(&envelope) {
                        return Some(envelope);
                    }
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Collects every envelope seen within the window.
pub async fn collect_for(ws: &mut Ws, window: Duration) -> Vec<Envelope> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(WsMessage::Text(frame)))) => {
                if let Ok(envelope) = Envelope::parse(&frame) {
                    seen.push(envelope);
                }
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    seen
}

/// In-memory 16 kHz mono WAV of a loud square wave (always voiced).
pub fn voiced_wav(ms: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..ms * 16 {
            writer
                .write_sample(if i % 2 == 0 { 9000i16 } else { -9000i16 })
                .unwrap();
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
