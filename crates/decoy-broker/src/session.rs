//! The per-call session actor.
//!
//! One task owns all mutable call state: legs, transcript, intelligence
//! snapshot, and the lifecycle state machine. Everything reaches it through
//! the inbox, so the session is a single-writer state machine and no lock
//! ordering exists to get wrong. Pipeline stages (normalisation, STT,
//! extraction, coaching, scanning) run in spawned tasks that report back
//! through the same inbox and race a session-scoped cancellation signal.

use crate::collab::{CollabError, Collaborators, Transcription, UrlVerdict};
use crate::config::BrokerConfig;
use crate::dispatch::{AnalysisDispatcher, LaneHealth};
use crate::egress::{EgressError, EgressQueue};
use crate::error::AttachError;
use crate::recording::RecordingSink;
use decoy_audio::recording::RecordHeader;
use decoy_audio::{pcm_to_le_bytes, TranscriptBuffer, Utterance};
use decoy_intel::{threat_score_update, Extraction, Extractor, LlmExtraction, ScoreFeatures};
use decoy_types::{
    CallId, CallStatus, CoachingSuggestion, Entity, EntityKind, Envelope, EndReason, ErrorCode,
    Role, SessionState, Tactic, TranscriptEntry,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

const INBOX_DEPTH: usize = 256;
const NORMALISER_DEPTH: usize = 32;

/// Egress codec tag for relayed canonical PCM.
const RELAY_CODEC: &str = "pcm-s16le";

/// Outcome of a successful attach.
#[derive(Debug, Clone, Copy)]
pub struct AttachOutcome {
    pub leg_id: u64,
    pub peer_present: bool,
}

/// Clonable handle to a session actor. The registry hands these out;
/// holding one never keeps session state alive past `Ended`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    call_id: CallId,
    inbox: mpsc::Sender<SessionMsg>,
    cancelled: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// True once the session reached `Ended` and fired its cancellation
    /// signal.
    pub fn is_ended(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub async fn attach(
        &self,
        role: Role,
        egress: EgressQueue,
    ) -> Result<AttachOutcome, AttachError> {
        let (reply, rx) = oneshot::channel();
        if self
            .inbox
            .send(SessionMsg::Attach { role, egress, reply })
            .await
            .is_err()
        {
            return Err(AttachError::Ended);
        }
        rx.await.map_err(|_| AttachError::Ended)?
    }

    pub async fn detach(&self, role: Role, leg_id: u64) {
        let _ = self.inbox.send(SessionMsg::Detach { role, leg_id }).await;
    }

    /// Feeds one parsed ingress envelope from a leg.
    pub async fn ingress(&self, role: Role, leg_id: u64, envelope: Envelope) {
        let _ = self
            .inbox
            .send(SessionMsg::Ingress {
                role,
                leg_id,
                envelope,
            })
            .await;
    }

    pub async fn end(&self, reason: EndReason) {
        let _ = self.inbox.send(SessionMsg::End { reason }).await;
    }

    pub async fn status(&self) -> Option<CallStatus> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(SessionMsg::Status { reply })
            .await
            .ok()?;
        rx.await.ok()
    }
}

enum SessionMsg {
    Attach {
        role: Role,
        egress: EgressQueue,
        reply: oneshot::Sender<Result<AttachOutcome, AttachError>>,
    },
    Detach {
        role: Role,
        leg_id: u64,
    },
    /// Internal: a leg's egress blocked past the slow-consumer deadline.
    LegLost {
        role: Role,
        leg_id: u64,
        reason: EndReason,
    },
    Ingress {
        role: Role,
        leg_id: u64,
        envelope: Envelope,
    },
    AudioReady {
        role: Role,
        leg_id: u64,
        pcm: Vec<i16>,
        seq: Option<u64>,
    },
    AudioRejected {
        role: Role,
        leg_id: u64,
        code: ErrorCode,
        message: String,
    },
    SttDone {
        role: Role,
        leg_id: u64,
        started_at_ms: u64,
        ended_at_ms: u64,
        outcome: Result<Transcription, LaneFailure>,
    },
    IntelReady {
        seq: u64,
        extraction: Extraction,
        llm_entities: Vec<Entity>,
        llm_tactics: Vec<Tactic>,
        llm_fatal: bool,
    },
    CoachDone {
        seq: u64,
        outcome: Result<CoachingSuggestion, LaneFailure>,
    },
    ScanDone {
        url: String,
        verdict: UrlVerdict,
    },
    End {
        reason: EndReason,
    },
    Status {
        reply: oneshot::Sender<CallStatus>,
    },
}

/// How a pipeline lane failed, after retry policy was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaneFailure {
    Transient,
    Fatal,
}

struct NormJob {
    payload: Vec<u8>,
    codec: String,
    seq: Option<u64>,
}

struct Leg {
    id: u64,
    egress: EgressQueue,
    transcriber: TranscriptBuffer,
    norm_tx: mpsc::Sender<NormJob>,
    /// Session-relative attach offset; leg-local audio clocks are shifted
    /// by this to stay comparable across legs.
    attach_offset_ms: u64,
    awaiting_pong: bool,
    missed_pongs: u32,
    stt_busy: bool,
    pending_windows: VecDeque<Utterance>,
}

pub(crate) struct Session {
    call_id: CallId,
    config: Arc<BrokerConfig>,
    collab: Collaborators,
    inbox: mpsc::Receiver<SessionMsg>,
    self_tx: mpsc::Sender<SessionMsg>,
    cancel_tx: watch::Sender<bool>,
    reaper_tx: mpsc::UnboundedSender<CallId>,

    state: SessionState,
    legs: HashMap<Role, Leg>,
    next_leg_id: u64,
    epoch: Instant,
    started_at: chrono::DateTime<chrono::Utc>,
    last_activity: Instant,

    transcript: Vec<TranscriptEntry>,
    next_seq: u64,
    intelligence: decoy_types::IntelligenceSnapshot,
    extractor: Extractor,
    intel_rounds_with_hits: u32,

    lanes: LaneHealth,
    dispatch: AnalysisDispatcher,
    grace_deadline: Option<Instant>,
    drain_reason: EndReason,
    recording: Option<RecordingSink>,
}

/// Spawns the actor task and returns its handle.
pub(crate) fn spawn(
    call_id: CallId,
    config: Arc<BrokerConfig>,
    collab: Collaborators,
    reaper_tx: mpsc::UnboundedSender<CallId>,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(INBOX_DEPTH);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = SessionHandle {
        call_id: call_id.clone(),
        inbox: tx.clone(),
        cancelled: cancel_rx,
    };
    let intel_concurrency = config.intel_concurrency;
    let session = Session {
        call_id,
        config,
        collab,
        inbox: rx,
        self_tx: tx,
        cancel_tx,
        reaper_tx,
        state: SessionState::Forming,
        legs: HashMap::new(),
        next_leg_id: 0,
        epoch: Instant::now(),
        started_at: chrono::Utc::now(),
        last_activity: Instant::now(),
        transcript: Vec::new(),
        next_seq: 0,
        intelligence: decoy_types::IntelligenceSnapshot::default(),
        extractor: Extractor::new(),
        intel_rounds_with_hits: 0,
        lanes: LaneHealth::default(),
        dispatch: AnalysisDispatcher::new(intel_concurrency),
        grace_deadline: None,
        drain_reason: EndReason::Timeout,
        recording: None,
    };
    tokio::spawn(session.run());
    handle
}

/// Resolves when the session cancellation signal fires (or its sender is
/// gone, which only happens after it fired).
pub(crate) async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn maybe_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(mut self) {
        let mut ping = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval(),
            self.config.ping_interval(),
        );
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut ended = false;
        while !ended {
            let grace = self.grace_deadline;
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(msg) => ended = self.handle_msg(msg).await,
                    None => break,
                },
                _ = ping.tick() => ended = self.on_ping_tick().await,
                _ = maybe_deadline(grace) => ended = self.on_grace_expired().await,
            }
        }
        self.finish().await;
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    async fn handle_msg(&mut self, msg: SessionMsg) -> bool {
        match msg {
            SessionMsg::Attach { role, egress, reply } => {
                let result = self.on_attach(role, egress).await;
                let _ = reply.send(result);
                false
            }
            SessionMsg::Detach { role, leg_id } => self.on_detach(role, leg_id).await,
            SessionMsg::LegLost {
                role,
                leg_id,
                reason,
            } => {
                let current = self.legs.get(&role).is_some_and(|l| l.id == leg_id);
                if current {
                    self.on_leg_lost(role, reason).await
                } else {
                    false
                }
            }
            SessionMsg::Ingress {
                role,
                leg_id,
                envelope,
            } => self.on_ingress(role, leg_id, envelope).await,
            SessionMsg::AudioReady {
                role,
                leg_id,
                pcm,
                seq,
            } => self.on_audio_ready(role, leg_id, pcm, seq).await,
            SessionMsg::AudioRejected {
                role,
                leg_id,
                code,
                message,
            } => {
                self.send_error(role, leg_id, code, message).await;
                false
            }
            SessionMsg::SttDone {
                role,
                leg_id,
                started_at_ms,
                ended_at_ms,
                outcome,
            } => {
                self.on_stt_done(role, leg_id, started_at_ms, ended_at_ms, outcome)
                    .await
            }
            SessionMsg::IntelReady {
                seq,
                extraction,
                llm_entities,
                llm_tactics,
                llm_fatal,
            } => {
                self.on_intel_ready(seq, extraction, llm_entities, llm_tactics, llm_fatal)
                    .await
            }
            SessionMsg::CoachDone { seq, outcome } => self.on_coach_done(seq, outcome).await,
            SessionMsg::ScanDone { url, verdict } => self.on_scan_done(url, verdict).await,
            SessionMsg::End { reason } => self.end_session(reason).await,
            SessionMsg::Status { reply } => {
                let _ = reply.send(self.status());
                false
            }
        }
    }

    fn status(&self) -> CallStatus {
        CallStatus {
            call_id: self.call_id.clone(),
            state: self.state,
            legs_present: self.legs.keys().copied().collect(),
            started_at: self.started_at.to_rfc3339(),
            idle_ms: self.last_activity.elapsed().as_millis() as u64,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    async fn on_attach(
        &mut self,
        role: Role,
        egress: EgressQueue,
    ) -> Result<AttachOutcome, AttachError> {
        if self.state == SessionState::Ended {
            return Err(AttachError::Ended);
        }
        if self.legs.contains_key(&role) {
            return Err(AttachError::RoleOccupied(role));
        }

        self.next_leg_id += 1;
        let leg_id = self.next_leg_id;
        let (norm_tx, norm_rx) = mpsc::channel(NORMALISER_DEPTH);
        spawn_normaliser(
            role,
            leg_id,
            norm_rx,
            self.self_tx.clone(),
            self.config.codec_allowlist.clone(),
            self.cancel_rx(),
        );

        let leg = Leg {
            id: leg_id,
            egress,
            transcriber: TranscriptBuffer::new(self.config.transcriber_config()),
            norm_tx,
            attach_offset_ms: self.now_ms(),
            awaiting_pong: false,
            missed_pongs: 0,
            stt_busy: false,
            pending_windows: VecDeque::new(),
        };

        let peer_present = !self.legs.is_empty();
        self.legs.insert(role, leg);
        self.last_activity = Instant::now();

        if self.recording.is_none() && self.config.recording_enabled {
            if let Some(dir) = self.config.recording_dir.clone() {
                self.recording = RecordingSink::spawn(
                    dir,
                    RecordHeader {
                        call_id: self.call_id.to_string(),
                        started_at: self.started_at.to_rfc3339(),
                        sample_rate: decoy_audio::SAMPLE_RATE,
                    },
                )
                .await;
            }
        }

        let connected = Envelope::Connected {
            role,
            call_id: self.call_id.to_string(),
            peer_present,
        };
        self.push_to(role, connected).await;

        if peer_present {
            let was_draining = self.state == SessionState::Draining;
            self.state = SessionState::Active;
            self.grace_deadline = None;
            self.drain_reason = EndReason::Timeout;
            tracing::info!(
                call_id = %self.call_id,
                %role,
                reattach = was_draining,
                "second leg attached; call active"
            );
            // Both legs learn about their (new) peer.
            let peer = role.peer();
            self.push_to(peer, Envelope::PeerJoined { role }).await;
            self.push_to(role, Envelope::PeerJoined { role: peer }).await;
        } else {
            self.state = SessionState::Forming;
            tracing::info!(call_id = %self.call_id, %role, "first leg attached; call forming");
        }

        Ok(AttachOutcome {
            leg_id,
            peer_present,
        })
    }

    async fn on_detach(&mut self, role: Role, leg_id: u64) -> bool {
        match self.legs.get(&role) {
            Some(leg) if leg.id == leg_id => {}
            // Stale detach from a replaced leg: ignore.
            _ => return false,
        }
        tracing::info!(call_id = %self.call_id, %role, "leg disconnected");
        self.on_leg_lost(role, EndReason::Timeout).await
    }

    /// Removes a leg and advances the state machine. `drain_reason` is the
    /// reason a later grace expiry will report.
    async fn on_leg_lost(&mut self, role: Role, drain_reason: EndReason) -> bool {
        if self.state == SessionState::Ended {
            return false;
        }
        let Some(leg) = self.legs.remove(&role) else {
            return false;
        };
        leg.egress.close();

        if self.legs.is_empty() {
            // Second disconnect ends the call outright.
            return self.end_session(drain_reason).await;
        }

        self.state = SessionState::Draining;
        self.drain_reason = drain_reason;
        self.grace_deadline = Some(Instant::now() + self.config.drain_grace());
        tracing::info!(call_id = %self.call_id, lost = %role, "call draining; grace timer started");

        let survivor = role.peer();
        self.push_to(survivor, Envelope::PeerLeft { role }).await;
        false
    }

    async fn on_grace_expired(&mut self) -> bool {
        self.grace_deadline = None;
        if self.state != SessionState::Draining {
            return false;
        }
        tracing::info!(call_id = %self.call_id, reason = self.drain_reason.as_str(), "grace expired");
        self.end_session(self.drain_reason).await
    }

    async fn on_ping_tick(&mut self) -> bool {
        if self.state == SessionState::Ended {
            return true;
        }
        let mut lost = Vec::new();
        let roles: Vec<Role> = self.legs.keys().copied().collect();
        for role in roles {
            let Some(leg) = self.legs.get_mut(&role) else {
                continue;
            };
            if leg.awaiting_pong {
                leg.missed_pongs += 1;
                if leg.missed_pongs >= self.config.missed_pong_limit {
                    tracing::warn!(call_id = %self.call_id, %role, "peer unresponsive; dropping leg");
                    lost.push(role);
                    continue;
                }
            }
            leg.awaiting_pong = true;
            self.push_to(role, Envelope::Ping).await;
        }
        for role in lost {
            if self.on_leg_lost(role, EndReason::Timeout).await {
                return true;
            }
        }
        false
    }

    /// Orderly teardown: notify, cancel, close, quiesce.
    async fn end_session(&mut self, reason: EndReason) -> bool {
        if self.state == SessionState::Ended {
            return true;
        }
        let duration_ms = self.now_ms();
        tracing::info!(call_id = %self.call_id, reason = reason.as_str(), duration_ms, "call ended");
        self.state = SessionState::Ended;
        self.grace_deadline = None;

        let farewell = Envelope::CallEnded {
            reason,
            duration_ms,
        };
        let queues: Vec<EgressQueue> = self.legs.values().map(|l| l.egress.clone()).collect();
        for queue in &queues {
            let _ = queue.push(farewell.clone()).await;
        }

        // Fire the session cancellation signal exactly once; every
        // in-flight collaborator call is racing it.
        let _ = self.cancel_tx.send(true);
        self.dispatch.abort_all();

        for queue in &queues {
            queue.close();
        }
        // Dropping legs closes the per-leg normaliser channels.
        self.legs.clear();
        self.recording = None;
        true
    }

    /// Post-loop cleanup: bounded egress drain, then registry removal.
    async fn finish(&mut self) {
        let _ = self.cancel_tx.send(true);
        let deadline = Instant::now() + self.config.drain_deadline();
        let queues: Vec<EgressQueue> = self.legs.values().map(|l| l.egress.clone()).collect();
        while Instant::now() < deadline && queues.iter().any(|q| !q.is_empty()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let _ = self.reaper_tx.send(self.call_id.clone());
    }

    fn invariant_violation(&self, detail: &str) {
        let correlation_id = uuid::Uuid::new_v4();
        tracing::error!(
            call_id = %self.call_id,
            %correlation_id,
            detail,
            "internal invariant violation; ending session"
        );
    }

    // ── Ingress ──────────────────────────────────────────────────

    async fn on_ingress(&mut self, role: Role, leg_id: u64, envelope: Envelope) -> bool {
        if self.state == SessionState::Ended {
            return true;
        }
        match self.legs.get(&role) {
            Some(leg) if leg.id == leg_id => {}
            _ => return false, // stale leg
        }
        self.last_activity = Instant::now();

        match envelope {
            Envelope::Audio {
                codec,
                payload,
                seq,
                ..
            } => {
                if let Some(sink) = &self.recording {
                    sink.append(role, self.now_ms(), payload.clone());
                }
                let leg = self.legs.get_mut(&role).expect("leg checked above");
                if leg
                    .norm_tx
                    .try_send(NormJob {
                        payload,
                        codec,
                        seq,
                    })
                    .is_err()
                {
                    tracing::trace!(call_id = %self.call_id, %role, "normaliser saturated; chunk dropped");
                }
                false
            }
            Envelope::Text { text, .. } => self.on_text(role, text).await,
            Envelope::RequestCoaching => {
                if role == Role::Operator {
                    let seq = self.next_seq;
                    self.spawn_coaching(seq);
                } else {
                    self.send_error(
                        role,
                        leg_id,
                        ErrorCode::UnknownEnvelope,
                        "request_coaching is operator-only".to_string(),
                    )
                    .await;
                }
                false
            }
            Envelope::Ping => {
                self.push_to(role, Envelope::Pong).await;
                false
            }
            Envelope::Pong => {
                if let Some(leg) = self.legs.get_mut(&role) {
                    leg.awaiting_pong = false;
                    leg.missed_pongs = 0;
                }
                false
            }
            Envelope::End => self.end_session(EndReason::Requested).await,
            other => {
                self.send_error(
                    role,
                    leg_id,
                    ErrorCode::UnknownEnvelope,
                    format!("egress-only envelope on ingress: {:?}", kind_of(&other)),
                )
                .await;
                false
            }
        }
    }

    /// Chat fallback: relayed verbatim, and scammer text feeds the
    /// analysis pipeline exactly like a finalised transcript.
    async fn on_text(&mut self, role: Role, text: String) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        let now = self.now_ms();
        let entry = self.record_transcript(role, text.clone(), "en".to_string(), 1.0, now, now);

        let peer = role.peer();
        if self.legs.contains_key(&peer) {
            self.push_to(
                peer,
                Envelope::Text {
                    text,
                    from: Some(role),
                },
            )
            .await;
        }

        if role == Role::Scammer {
            self.spawn_intel(entry.seq, entry.text.clone(), entry.language.clone());
            self.spawn_coaching(entry.seq);
        }
        false
    }

    async fn send_error(&mut self, role: Role, leg_id: u64, code: ErrorCode, message: String) {
        match self.legs.get(&role) {
            Some(leg) if leg.id == leg_id => {}
            _ => return,
        }
        self.push_to(role, Envelope::Error { code, message }).await;
    }

    // ── Audio path ───────────────────────────────────────────────

    async fn on_audio_ready(
        &mut self,
        role: Role,
        leg_id: u64,
        pcm: Vec<i16>,
        seq: Option<u64>,
    ) -> bool {
        if self.state == SessionState::Ended {
            return true;
        }
        match self.legs.get(&role) {
            Some(leg) if leg.id == leg_id => {}
            _ => return false,
        }

        // Relay first: transcripts never gate audio.
        if self.state == SessionState::Active {
            if self.legs.len() != 2 {
                self.invariant_violation("active session without two legs");
                return self.end_session(EndReason::InternalError).await;
            }
            let peer = role.peer();
            if let Some(peer_leg) = self.legs.get(&peer) {
                let relay = Envelope::Audio {
                    codec: RELAY_CODEC.to_string(),
                    payload: pcm_to_le_bytes(&pcm),
                    seq,
                    source: Some(role),
                };
                match peer_leg.egress.push_audio(relay) {
                    Ok(0) => {}
                    Ok(shed) => {
                        tracing::trace!(call_id = %self.call_id, %peer, shed, "audio shed under backpressure")
                    }
                    Err(_) => {}
                }
            }
        }

        // Feed the sending leg's transcriber and drive any triggered
        // windows through STT, strictly in order per leg.
        let leg = self.legs.get_mut(&role).expect("leg checked above");
        leg.transcriber.ingest(&pcm);
        let mut windows = Vec::new();
        while let Some(utterance) = leg.transcriber.poll() {
            windows.push(utterance);
        }
        for utterance in windows {
            self.queue_stt(role, utterance);
        }
        false
    }

    fn queue_stt(&mut self, role: Role, utterance: Utterance) {
        if !self.lanes.stt {
            return;
        }
        let Some(leg) = self.legs.get_mut(&role) else {
            return;
        };
        if leg.stt_busy {
            leg.pending_windows.push_back(utterance);
            return;
        }
        leg.stt_busy = true;
        self.spawn_stt(role, utterance);
    }

    fn spawn_stt(&mut self, role: Role, utterance: Utterance) {
        let Some(leg) = self.legs.get(&role) else {
            return;
        };
        let leg_id = leg.id;
        let offset = leg.attach_offset_ms;
        let stt = self.collab.stt.clone();
        let timeout = self.config.stt_timeout();
        let inbox = self.self_tx.clone();
        let cancel = self.cancel_rx();

        tokio::spawn(async move {
            let pcm = Arc::new(utterance.pcm);
            let call = {
                let stt = stt.clone();
                move || {
                    let stt = stt.clone();
                    let pcm = pcm.clone();
                    async move { stt.transcribe(&pcm, None).await }
                }
            };
            let outcome = tokio::select! {
                _ = cancelled(cancel) => return,
                r = with_retry("stt", timeout, call) => r,
            };
            let _ = inbox
                .send(SessionMsg::SttDone {
                    role,
                    leg_id,
                    started_at_ms: offset + utterance.start_ms,
                    ended_at_ms: offset + utterance.end_ms,
                    outcome,
                })
                .await;
        });
    }

    async fn on_stt_done(
        &mut self,
        role: Role,
        leg_id: u64,
        started_at_ms: u64,
        ended_at_ms: u64,
        outcome: Result<Transcription, LaneFailure>,
    ) -> bool {
        if self.state == SessionState::Ended {
            return true;
        }

        // Keep per-leg STT strictly sequential.
        let mut next_window = None;
        if let Some(leg) = self.legs.get_mut(&role) {
            if leg.id == leg_id {
                leg.stt_busy = false;
                if let Some(next) = leg.pending_windows.pop_front() {
                    leg.stt_busy = true;
                    next_window = Some(next);
                }
            }
        }
        if let Some(next) = next_window {
            self.spawn_stt(role, next);
        }

        let transcription = match outcome {
            Ok(t) => t,
            Err(LaneFailure::Transient) => {
                tracing::warn!(call_id = %self.call_id, %role, "transcription window discarded after retry");
                return false;
            }
            Err(LaneFailure::Fatal) => {
                tracing::error!(call_id = %self.call_id, %role, "stt lane disabled for this session");
                self.lanes.stt = false;
                return false;
            }
        };
        if transcription.text.trim().is_empty() {
            return false;
        }

        let entry = self.record_transcript(
            role,
            transcription.text,
            transcription.language,
            transcription.confidence,
            started_at_ms,
            ended_at_ms,
        );

        let envelope = Envelope::Transcript {
            speaker: entry.speaker,
            text: entry.text.clone(),
            language: entry.language.clone(),
            confidence: entry.confidence,
            started_at_ms: entry.started_at_ms,
            ended_at_ms: entry.ended_at_ms,
        };
        for target in [Role::Operator, Role::Scammer] {
            if self.legs.contains_key(&target) {
                self.push_to(target, envelope.clone()).await;
            }
        }

        if role == Role::Scammer {
            self.spawn_intel(entry.seq, entry.text.clone(), entry.language.clone());
            self.spawn_coaching(entry.seq);
        }
        false
    }

    /// Appends to the session transcript and persists best-effort.
    fn record_transcript(
        &mut self,
        speaker: Role,
        text: String,
        language: String,
        confidence: f32,
        started_at_ms: u64,
        ended_at_ms: u64,
    ) -> TranscriptEntry {
        self.next_seq += 1;
        let entry = TranscriptEntry {
            speaker,
            text,
            language,
            confidence,
            started_at_ms,
            ended_at_ms,
            seq: self.next_seq,
        };
        self.transcript.push(entry.clone());

        let persistence = self.collab.persistence.clone();
        let call_id = self.call_id.clone();
        let persisted = entry.clone();
        let cancel = self.cancel_rx();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled(cancel) => {}
                r = persistence.append_transcript(&call_id, &persisted) => {
                    if let Err(e) = r {
                        tracing::warn!(call_id = %call_id, error = %e, "transcript persistence failed");
                    }
                }
            }
        });
        entry
    }

    // ── Analysis lanes ───────────────────────────────────────────

    fn spawn_intel(&mut self, seq: u64, text: String, language: String) {
        self.dispatch.begin_intel(seq);
        let permits = self.dispatch.intel_permits();
        let llm_enabled = self.lanes.extraction_llm;
        let llm = self.collab.llm.clone();
        let extractor = self.extractor.clone();
        let timeout = self.config.llm_extract_timeout();
        let inbox = self.self_tx.clone();
        let cancel = self.cancel_rx();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return; // semaphore closed at teardown
            };

            // Stage A always runs; the model can only add to it.
            let extraction = extractor.extract(&text, &language);

            let mut llm_entities = Vec::new();
            let mut llm_tactics = Vec::new();
            let mut llm_fatal = false;
            if llm_enabled {
                let text_arc = Arc::new(text);
                let call = {
                    let llm = llm.clone();
                    move || {
                        let llm = llm.clone();
                        let text = text_arc.clone();
                        async move { llm.extract_entities(&text).await }
                    }
                };
                let result = tokio::select! {
                    _ = cancelled(cancel) => return,
                    r = with_retry("llm-extract", timeout, call) => r,
                };
                match result {
                    Ok(value) => match LlmExtraction::validate(value) {
                        Ok(valid) => {
                            let (entities, tactics) = valid.into_typed();
                            llm_entities = entities;
                            llm_tactics = tactics;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "model extraction discarded");
                        }
                    },
                    Err(LaneFailure::Fatal) => llm_fatal = true,
                    Err(LaneFailure::Transient) => {}
                }
            }

            let _ = inbox
                .send(SessionMsg::IntelReady {
                    seq,
                    extraction,
                    llm_entities,
                    llm_tactics,
                    llm_fatal,
                })
                .await;
        });
    }

    async fn on_intel_ready(
        &mut self,
        seq: u64,
        extraction: Extraction,
        llm_entities: Vec<Entity>,
        llm_tactics: Vec<Tactic>,
        llm_fatal: bool,
    ) -> bool {
        if self.state == SessionState::Ended {
            return true;
        }
        if llm_fatal && self.lanes.extraction_llm {
            tracing::error!(call_id = %self.call_id, "model extraction disabled for this session");
            self.lanes.extraction_llm = false;
        }

        let now = self.now_ms();
        let had_hits = !extraction.keyword_hits.is_empty();
        let max_severity = extraction
            .keyword_hits
            .iter()
            .map(|h| h.severity)
            .max();

        let mut candidates = extraction.entities;
        candidates.extend(llm_entities);
        let has_url = candidates.iter().any(|e| e.kind == EntityKind::Url);

        let mut tactics: Vec<Tactic> = extraction.tactics;
        tactics.extend(llm_tactics);
        let credential_request = tactics.contains(&Tactic::CredentialRequest);

        let entities_delta = self.intelligence.merge_entities(candidates, now);
        let tactics_delta = self.intelligence.merge_tactics(tactics, now);

        let features = ScoreFeatures {
            max_severity,
            credential_request,
            has_url,
            malicious_url: false,
            repeat_rounds: self.intel_rounds_with_hits,
        };
        let proposed = threat_score_update(self.intelligence.threat_score, &features);
        let score_changed = self.intelligence.raise_score(proposed, now);
        if had_hits {
            self.intel_rounds_with_hits += 1;
        }

        // New URLs get an out-of-band reputation probe.
        for entity in &entities_delta {
            if entity.kind == EntityKind::Url {
                self.spawn_url_scan(entity.value.clone());
            }
        }

        if !entities_delta.is_empty() || !tactics_delta.is_empty() || score_changed {
            self.emit_intelligence(entities_delta, tactics_delta).await;
        }

        if let Some(suggestion) = self.dispatch.finish_intel(seq) {
            self.emit_coaching(suggestion).await;
        }
        false
    }

    async fn emit_intelligence(&mut self, entities_delta: Vec<Entity>, tactics_delta: Vec<Tactic>) {
        let envelope = Envelope::Intelligence {
            entities_delta,
            tactics_delta,
            threat_score: self.intelligence.threat_score,
        };
        if self.legs.contains_key(&Role::Operator) {
            self.push_to(Role::Operator, envelope).await;
        }

        let persistence = self.collab.persistence.clone();
        let call_id = self.call_id.clone();
        let snapshot = self.intelligence.clone();
        let cancel = self.cancel_rx();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled(cancel) => {}
                r = persistence.update_intelligence(&call_id, &snapshot) => {
                    if let Err(e) = r {
                        tracing::warn!(call_id = %call_id, error = %e, "intelligence persistence failed");
                    }
                }
            }
        });
    }

    fn spawn_url_scan(&self, url: String) {
        let scanner = self.collab.scanner.clone();
        let timeout = self.config.url_scan_timeout();
        let inbox = self.self_tx.clone();
        let cancel = self.cancel_rx();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancelled(cancel) => return,
                r = tokio::time::timeout(timeout, scanner.check(&url)) => r,
            };
            match result {
                Ok(Ok(verdict)) => {
                    let _ = inbox.send(SessionMsg::ScanDone { url, verdict }).await;
                }
                Ok(Err(e)) => tracing::debug!(url, error = %e, "url scan failed"),
                Err(_) => tracing::debug!(url, "url scan timed out"),
            }
        });
    }

    async fn on_scan_done(&mut self, url: String, verdict: UrlVerdict) -> bool {
        if self.state == SessionState::Ended {
            return true;
        }
        if verdict.is_safe {
            return false;
        }
        tracing::warn!(call_id = %self.call_id, url, risk = verdict.risk_score, "malicious url confirmed");
        let now = self.now_ms();
        let tactics_delta = self.intelligence.merge_tactics([Tactic::MaliciousUrl], now);
        let features = ScoreFeatures {
            has_url: true,
            malicious_url: true,
            repeat_rounds: self.intel_rounds_with_hits,
            ..Default::default()
        };
        let proposed = threat_score_update(self.intelligence.threat_score, &features);
        let score_changed = self.intelligence.raise_score(proposed, now);
        if !tactics_delta.is_empty() || score_changed {
            self.emit_intelligence(Vec::new(), tactics_delta).await;
        }
        false
    }

    fn spawn_coaching(&mut self, seq: u64) {
        if !self.lanes.coaching {
            return;
        }
        let context: Vec<TranscriptEntry> = self
            .transcript
            .iter()
            .rev()
            .take(self.config.context_window)
            .cloned()
            .collect();
        let snapshot = self.intelligence.clone();
        let llm = self.collab.llm.clone();
        let tts = self.collab.tts.clone();
        let voice = self.config.coaching_voice.clone();
        let coach_timeout = self.config.llm_coach_timeout();
        let tts_timeout = self.config.tts_timeout();
        let inbox = self.self_tx.clone();
        let cancel = self.cancel_rx();
        let created_at_ms = self.now_ms();

        let handle = tokio::spawn(async move {
            let context = Arc::new(context);
            let snapshot = Arc::new(snapshot);
            let call = {
                let llm = llm.clone();
                let context = context.clone();
                let snapshot = snapshot.clone();
                move || {
                    let llm = llm.clone();
                    let context = context.clone();
                    let snapshot = snapshot.clone();
                    async move { llm.coach(&context, &snapshot).await }
                }
            };
            let coaching = tokio::select! {
                _ = cancelled(cancel.clone()) => return,
                r = with_retry("llm-coach", coach_timeout, call) => r,
            };

            let outcome = match coaching {
                Ok(coaching) => {
                    let tts_call = {
                        let tts = tts.clone();
                        let text = coaching.text.clone();
                        let voice = voice.clone();
                        move || {
                            let tts = tts.clone();
                            let text = text.clone();
                            let voice = voice.clone();
                            async move { tts.synthesize(&text, &voice).await }
                        }
                    };
                    let audio = tokio::select! {
                        _ = cancelled(cancel) => return,
                        r = with_retry("tts", tts_timeout, tts_call) => r.ok(),
                    };
                    let (audio, audio_codec) = match audio {
                        Some((bytes, codec)) if !bytes.is_empty() => (Some(bytes), Some(codec)),
                        // TTS failure downgrades to a text-only suggestion.
                        _ => (None, None),
                    };
                    Ok(CoachingSuggestion {
                        text: coaching.text,
                        strategy: coaching.strategy,
                        intent: coaching.intent,
                        audio,
                        audio_codec,
                        created_at_ms,
                    })
                }
                Err(failure) => Err(failure),
            };
            let _ = inbox.send(SessionMsg::CoachDone { seq, outcome }).await;
        });

        self.dispatch.replace_coaching(seq, handle);
    }

    async fn on_coach_done(
        &mut self,
        seq: u64,
        outcome: Result<CoachingSuggestion, LaneFailure>,
    ) -> bool {
        if self.state == SessionState::Ended {
            return true;
        }
        if !self.dispatch.coaching_done(seq) {
            return false; // superseded by a newer transcript
        }
        match outcome {
            Ok(suggestion) => {
                if self.dispatch.intel_is_pending(seq) {
                    // Intelligence first: hold until that round lands.
                    self.dispatch.hold_suggestion(seq, suggestion);
                } else {
                    self.emit_coaching(suggestion).await;
                }
            }
            Err(LaneFailure::Fatal) => {
                tracing::error!(call_id = %self.call_id, "coaching lane disabled for this session");
                self.lanes.coaching = false;
            }
            Err(LaneFailure::Transient) => {
                tracing::warn!(call_id = %self.call_id, "coaching suggestion dropped after retry");
            }
        }
        false
    }

    async fn emit_coaching(&mut self, suggestion: CoachingSuggestion) {
        if !self.legs.contains_key(&Role::Operator) {
            return;
        }
        let envelope = Envelope::Coaching {
            text: suggestion.text,
            strategy: suggestion.strategy,
            intent: suggestion.intent,
            audio: suggestion.audio,
            audio_codec: suggestion.audio_codec,
            threat_score: self.intelligence.threat_score,
        };
        self.push_to(Role::Operator, envelope).await;
    }

    // ── Egress ───────────────────────────────────────────────────

    /// Pushes a must-deliver envelope to a leg, escalating a sustained
    /// block to a slow-consumer drain. Returns false when the leg is gone.
    ///
    /// The drain itself goes back through the inbox so the state machine
    /// is never re-entered from inside another transition.
    async fn push_to(&mut self, role: Role, envelope: Envelope) -> bool {
        let Some((leg_id, queue)) = self.legs.get(&role).map(|l| (l.id, l.egress.clone())) else {
            return false;
        };
        match queue.push(envelope).await {
            Ok(()) => true,
            Err(EgressError::Closed) => false,
            Err(EgressError::SlowConsumer) => {
                tracing::warn!(call_id = %self.call_id, %role, "slow consumer; draining leg");
                // Fail later pushes fast; removal happens on the LegLost
                // message.
                queue.close();
                let _ = self.self_tx.try_send(SessionMsg::LegLost {
                    role,
                    leg_id,
                    reason: EndReason::SlowConsumer,
                });
                false
            }
        }
    }
}

fn kind_of(envelope: &Envelope) -> &'static str {
    match envelope {
        Envelope::Audio { .. } => "audio",
        Envelope::Text { .. } => "text",
        Envelope::RequestCoaching => "request_coaching",
        Envelope::Connected { .. } => "connected",
        Envelope::Transcript { .. } => "transcript",
        Envelope::Coaching { .. } => "coaching",
        Envelope::Intelligence { .. } => "intelligence",
        Envelope::Ping => "ping",
        Envelope::Pong => "pong",
        Envelope::PeerJoined { .. } => "peer_joined",
        Envelope::PeerLeft { .. } => "peer_left",
        Envelope::End => "end",
        Envelope::CallEnded { .. } => "call_ended",
        Envelope::Error { .. } => "error",
    }
}

/// Per-leg normalisation worker: decodes sequentially so relayed audio
/// keeps its order, off-loading the CPU work to the blocking pool.
fn spawn_normaliser(
    role: Role,
    leg_id: u64,
    mut rx: mpsc::Receiver<NormJob>,
    inbox: mpsc::Sender<SessionMsg>,
    allowlist: Vec<String>,
    cancel: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                _ = cancelled(cancel.clone()) => return,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            };

            if !allowlist.contains(&job.codec) {
                let _ = inbox
                    .send(SessionMsg::AudioRejected {
                        role,
                        leg_id,
                        code: ErrorCode::UnsupportedCodec,
                        message: format!("codec not allowed for this session: {}", job.codec),
                    })
                    .await;
                continue;
            }

            let codec = job.codec;
            let payload = job.payload;
            let seq = job.seq;
            let decoded = tokio::task::spawn_blocking(move || {
                decoy_audio::normalise(&codec, &payload)
            })
            .await;

            match decoded {
                Ok(Ok(pcm)) if !pcm.is_empty() => {
                    let _ = inbox
                        .send(SessionMsg::AudioReady {
                            role,
                            leg_id,
                            pcm,
                            seq,
                        })
                        .await;
                }
                Ok(Ok(_)) => {}
                Ok(Err(decoy_audio::AudioError::UnsupportedCodec(e))) => {
                    let _ = inbox
                        .send(SessionMsg::AudioRejected {
                            role,
                            leg_id,
                            code: ErrorCode::UnsupportedCodec,
                            message: e.to_string(),
                        })
                        .await;
                }
                Ok(Err(e)) => {
                    // Partial container chunks are routine in streamed
                    // capture; skip and keep the stream alive.
                    tracing::debug!(%role, error = %e, "chunk skipped (decode failed)");
                }
                Err(e) => {
                    tracing::warn!(%role, error = %e, "normalise task join error");
                }
            }
        }
    });
}

/// Runs a collaborator call with the standard retry policy: one retry on
/// transient failure or timeout, immediate stop on fatal failure.
pub(crate) async fn with_retry<T, F, Fut>(
    lane: &'static str,
    timeout: Duration,
    mut call: F,
) -> Result<T, LaneFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollabError>>,
{
    for attempt in 0u32..2 {
        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(CollabError::Fatal(e))) => {
                tracing::error!(lane, error = %e, "fatal collaborator failure");
                return Err(LaneFailure::Fatal);
            }
            Ok(Err(CollabError::Transient(e))) => {
                tracing::warn!(lane, attempt, error = %e, "transient collaborator failure");
            }
            Err(_) => {
                tracing::warn!(lane, attempt, timeout_ms = timeout.as_millis() as u64, "collaborator call timed out");
            }
        }
    }
    Err(LaneFailure::Transient)
}
