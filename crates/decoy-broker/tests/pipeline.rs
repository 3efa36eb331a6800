//! Analysis pipeline tests: transcription ordering, intelligence
//! coalescing, threat-score monotonicity, lane isolation, and
//! cancellation cleanup.

mod common;

use common::*;
use decoy_broker::collab::fakes::{ScriptedModel, ScriptedStt, StubScanner};
use decoy_broker::collab::CollabError;
use decoy_broker::CallRegistry;
use decoy_types::{EntityKind, Envelope, ErrorCode, Role, SessionState, Tactic};
use std::time::Duration;

/// Attaches both legs; returns (handle, operator receiver, scammer leg id).
async fn active_call(
    registry: &CallRegistry,
    id: &decoy_types::CallId,
    config: &decoy_broker::BrokerConfig,
) -> (
    decoy_broker::SessionHandle,
    decoy_broker::EgressReceiver,
    u64,
) {
    let (queue_op, rx_op) = leg(config);
    let (handle, _) = registry.attach(id, Role::Operator, queue_op).await.unwrap();
    let (queue_sc, rx_sc) = leg(config);
    let (_, sc) = registry.attach(id, Role::Scammer, queue_sc).await.unwrap();
    drain(rx_sc);
    (handle, rx_op, sc.leg_id)
}

#[tokio::test]
async fn scammer_speech_yields_transcript_intelligence_then_coaching() {
    let config = test_config();
    let (registry, handles) = registry_with(
        ScriptedStt::always("Please share your OTP now"),
        config.clone(),
    );
    let id = call_id("happy-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    // Four 900 ms chunks cross the 3 s voiced window.
    feed_voiced(&handle, Role::Scammer, sc_leg, 900, 4).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let seen = envelopes.lock().unwrap();
                if seen.iter().any(|e| matches!(e, Envelope::Coaching { .. })) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("coaching never arrived");

    let seen = envelopes.lock().unwrap();

    let transcript_at = seen
        .iter()
        .position(|e| matches!(e, Envelope::Transcript { speaker: Role::Scammer, .. }))
        .expect("transcript envelope");
    let intel_at = seen
        .iter()
        .position(|e| matches!(e, Envelope::Intelligence { .. }))
        .expect("intelligence envelope");
    let coaching_at = seen
        .iter()
        .position(|e| matches!(e, Envelope::Coaching { .. }))
        .expect("coaching envelope");
    assert!(transcript_at < intel_at, "intelligence before its transcript");
    assert!(intel_at < coaching_at, "coaching overtook intelligence");

    match &seen[intel_at] {
        Envelope::Intelligence {
            entities_delta,
            tactics_delta,
            threat_score,
        } => {
            assert!(entities_delta
                .iter()
                .any(|e| e.kind == EntityKind::Keyword && e.value == "otp"));
            assert!(tactics_delta.contains(&Tactic::CredentialRequest));
            assert!(*threat_score >= 0.5, "threat score {threat_score} too low");
        }
        _ => unreachable!(),
    }

    assert!(
        !handles.persistence.transcripts.lock().unwrap().is_empty(),
        "transcript was not persisted"
    );
}

#[tokio::test]
async fn transcript_timestamps_are_monotone_per_leg() {
    let config = test_config();
    let (registry, _handles) = registry_with(ScriptedStt::always("segment"), config.clone());
    let id = call_id("monotone-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    // Three windows' worth of speech, fed in order.
    feed_voiced(&handle, Role::Scammer, sc_leg, 800, 12).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let seen = envelopes.lock().unwrap();
    let transcripts: Vec<(u64, u64)> = seen
        .iter()
        .filter_map(|e| match e {
            Envelope::Transcript {
                speaker: Role::Scammer,
                started_at_ms,
                ended_at_ms,
                ..
            } => Some((*started_at_ms, *ended_at_ms)),
            _ => None,
        })
        .collect();
    assert!(
        transcripts.len() >= 2,
        "expected several transcript windows, got {}",
        transcripts.len()
    );
    for pair in transcripts.windows(2) {
        assert!(
            pair[1].1 >= pair[0].1,
            "ended_at went backwards: {:?}",
            transcripts
        );
    }
}

#[tokio::test]
async fn threat_score_never_decreases_across_envelopes() {
    let config = test_config();
    let stt = ScriptedStt::always("nothing interesting");
    stt.push_response(Ok(decoy_broker::collab::Transcription {
        text: "share your otp and password immediately".to_string(),
        language: "en".to_string(),
        confidence: 0.9,
    }));
    stt.push_response(Ok(decoy_broker::collab::Transcription {
        text: "lovely weather today".to_string(),
        language: "en".to_string(),
        confidence: 0.9,
    }));
    stt.push_response(Ok(decoy_broker::collab::Transcription {
        text: "you will be arrested, this is the police".to_string(),
        language: "en".to_string(),
        confidence: 0.9,
    }));
    let (registry, _handles) = registry_with(stt, config.clone());
    let id = call_id("score-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    feed_voiced(&handle, Role::Scammer, sc_leg, 800, 16).await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    let seen = envelopes.lock().unwrap();
    let scores: Vec<f32> = seen
        .iter()
        .filter_map(|e| match e {
            Envelope::Intelligence { threat_score, .. } => Some(*threat_score),
            _ => None,
        })
        .collect();
    assert!(!scores.is_empty(), "no intelligence envelopes emitted");
    for pair in scores.windows(2) {
        assert!(pair[1] >= pair[0], "threat score decreased: {scores:?}");
    }
}

#[tokio::test]
async fn same_phone_in_two_formats_coalesces_to_one_entity() {
    let config = test_config();
    let stt = ScriptedStt::always("filler");
    stt.push_response(Ok(decoy_broker::collab::Transcription {
        text: "call me back at +91-98765-43210".to_string(),
        language: "en".to_string(),
        confidence: 0.9,
    }));
    stt.push_response(Ok(decoy_broker::collab::Transcription {
        text: "the number is 919876543210 okay".to_string(),
        language: "en".to_string(),
        confidence: 0.9,
    }));
    let (registry, _handles) = registry_with(stt, config.clone());
    let id = call_id("coalesce-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    feed_voiced(&handle, Role::Scammer, sc_leg, 800, 10).await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    let seen = envelopes.lock().unwrap();
    let phones: Vec<String> = seen
        .iter()
        .filter_map(|e| match e {
            Envelope::Intelligence { entities_delta, .. } => Some(entities_delta),
            _ => None,
        })
        .flatten()
        .filter(|e| e.kind == EntityKind::Phone)
        .map(|e| e.value.clone())
        .collect();
    assert_eq!(
        phones,
        vec!["919876543210".to_string()],
        "phone entity was not coalesced"
    );
}

#[tokio::test]
async fn coaching_waits_for_its_intelligence_round() {
    let config = test_config();
    let (_handles, collaborators) = common::TestCollab::new(
        ScriptedStt::always("read me the otp"),
        ScriptedModel::default().with_extract_delay(Duration::from_millis(300)),
        StubScanner::default(),
    );
    let registry = CallRegistry::new(config.clone(), collaborators);
    let id = call_id("order-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    feed_voiced(&handle, Role::Scammer, sc_leg, 900, 4).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let seen = envelopes.lock().unwrap();
    let intel_at = seen
        .iter()
        .position(|e| matches!(e, Envelope::Intelligence { .. }))
        .expect("intelligence envelope");
    let coaching_at = seen
        .iter()
        .position(|e| matches!(e, Envelope::Coaching { .. }))
        .expect("coaching envelope");
    assert!(
        intel_at < coaching_at,
        "coaching emitted before the intelligence it references"
    );
}

#[tokio::test]
async fn audio_is_relayed_to_the_peer_and_never_echoed() {
    let config = test_config();
    let (registry, _handles) = registry_with(ScriptedStt::silent(), config.clone());
    let id = call_id("relay-1");

    let (queue_op, rx_op) = leg(&config);
    registry.attach(&id, Role::Operator, queue_op).await.unwrap();
    let (queue_sc, rx_sc) = leg(&config);
    let (handle, sc) = registry.attach(&id, Role::Scammer, queue_sc).await.unwrap();
    let operator_seen = collect(rx_op);
    let scammer_seen = collect(rx_sc);

    for seq in 0..5u64 {
        handle
            .ingress(
                Role::Scammer,
                sc.leg_id,
                Envelope::Audio {
                    codec: "wav-pcm".to_string(),
                    payload: voiced_wav(200),
                    seq: Some(seq),
                    source: None,
                },
            )
            .await;
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let operator = operator_seen.lock().unwrap();
    let relayed: Vec<Option<u64>> = operator
        .iter()
        .filter_map(|e| match e {
            Envelope::Audio { seq, source, .. } => {
                assert_eq!(*source, Some(Role::Scammer));
                Some(*seq)
            }
            _ => None,
        })
        .collect();
    assert_eq!(relayed.len(), 5, "each chunk relays exactly once");
    // No chunk ever comes back to its sender.
    let scammer = scammer_seen.lock().unwrap();
    assert!(
        !scammer.iter().any(|e| matches!(e, Envelope::Audio { .. })),
        "audio echoed back to the sending leg"
    );
}

#[tokio::test]
async fn stt_outage_leaves_audio_relay_untouched() {
    let config = test_config();
    let (registry, handles) = registry_with(ScriptedStt::failing(), config.clone());
    let id = call_id("outage-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    feed_voiced(&handle, Role::Scammer, sc_leg, 900, 4).await;
    tokio::time::sleep(Duration::from_millis(700)).await;

    let seen = envelopes.lock().unwrap();
    assert!(
        seen.iter().any(|e| matches!(e, Envelope::Audio { .. })),
        "audio relay stopped during stt outage"
    );
    assert!(
        !seen.iter().any(|e| matches!(e, Envelope::Transcript { .. })),
        "transcript emitted despite stt outage"
    );
    // One retry per window.
    assert!(handles.stt.call_count() >= 2);
    assert_eq!(handle.status().await.unwrap().state, SessionState::Active);
}

#[tokio::test]
async fn malicious_url_verdict_arrives_out_of_band() {
    let config = test_config();
    let scanner = StubScanner::default().with_delay(Duration::from_millis(200));
    scanner.flag_malicious("http://malware.testing.google.test");
    let (_handles, collaborators) = common::TestCollab::new(
        ScriptedStt::always("visit http://malware.testing.google.test now"),
        ScriptedModel::default(),
        scanner,
    );
    let registry = CallRegistry::new(config.clone(), collaborators);
    let id = call_id("scan-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    feed_voiced(&handle, Role::Scammer, sc_leg, 900, 4).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let seen = envelopes.lock().unwrap();
    let intel: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            Envelope::Intelligence {
                entities_delta,
                tactics_delta,
                threat_score,
            } => Some((entities_delta.clone(), tactics_delta.clone(), *threat_score)),
            _ => None,
        })
        .collect();
    assert!(intel.len() >= 2, "expected primary + scanner envelopes, got {intel:?}");

    let (first_entities, first_tactics, first_score) = &intel[0];
    assert!(first_entities
        .iter()
        .any(|e| e.kind == EntityKind::Url
            && e.value == "http://malware.testing.google.test"));
    assert!(!first_tactics.contains(&Tactic::MaliciousUrl));

    let flagged = intel
        .iter()
        .find(|(_, tactics, _)| tactics.contains(&Tactic::MaliciousUrl))
        .expect("scanner verdict envelope");
    assert!(
        flagged.2 > *first_score,
        "malicious verdict did not raise the score ({} vs {first_score})",
        flagged.2
    );
}

#[tokio::test]
async fn cancellation_stops_collaborator_side_effects() {
    let config = test_config();
    let (handles, collaborators) = common::TestCollab::new(
        ScriptedStt::always("anything").with_delay(Duration::from_millis(400)),
        ScriptedModel::default(),
        StubScanner::default().with_delay(Duration::from_millis(400)),
    );
    let registry = CallRegistry::new(config.clone(), collaborators);
    let id = call_id("cancel-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    drain(rx_op);

    // Start a window transcribing, then end the call mid-flight.
    feed_voiced(&handle, Role::Scammer, sc_leg, 900, 4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handles.stt.call_count() >= 1, "stt call never started");
    registry.end(&id).await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        handles.stt.completed_count(),
        0,
        "an stt call completed its side effects after end"
    );
    assert_eq!(handles.scanner.completed.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scammer_text_message_feeds_the_pipeline() {
    let config = test_config();
    let (registry, _handles) = registry_with(ScriptedStt::silent(), config.clone());
    let id = call_id("text-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    handle
        .ingress(
            Role::Scammer,
            sc_leg,
            Envelope::Text {
                text: "send money to fraudster@ybl today".to_string(),
                from: None,
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let seen = envelopes.lock().unwrap();
    assert!(
        seen.iter().any(|e| matches!(e, Envelope::Text { from: Some(Role::Scammer), .. })),
        "text was not relayed to the operator"
    );
    assert!(
        seen.iter().any(|e| match e {
            Envelope::Intelligence { entities_delta, .. } => entities_delta
                .iter()
                .any(|en| en.kind == EntityKind::UpiHandle && en.value == "fraudster@ybl"),
            _ => false,
        }),
        "upi handle was not extracted from the text message"
    );
}

#[tokio::test]
async fn unsupported_codec_is_reported_and_survivable() {
    let config = test_config();
    let (registry, _handles) = registry_with(ScriptedStt::silent(), config.clone());
    let id = call_id("codec-1");

    let (queue_op, rx_op) = leg(&config);
    registry.attach(&id, Role::Operator, queue_op).await.unwrap();
    drain(rx_op);
    let (queue_sc, mut rx_sc) = leg(&config);
    let (handle, sc) = registry.attach(&id, Role::Scammer, queue_sc).await.unwrap();

    handle
        .ingress(
            Role::Scammer,
            sc.leg_id,
            Envelope::Audio {
                codec: "flac".to_string(),
                payload: vec![1, 2, 3, 4],
                seq: None,
                source: None,
            },
        )
        .await;

    let error = recv_matching(&mut rx_sc, Duration::from_secs(1), |e| {
        matches!(e, Envelope::Error { code: ErrorCode::UnsupportedCodec, .. })
    })
    .await;
    assert!(error.is_some(), "sender was not told about the bad codec");

    // The leg is still alive and transcribing after the bad chunk.
    handle
        .ingress(Role::Scammer, sc.leg_id, Envelope::Ping)
        .await;
    let pong = recv_matching(&mut rx_sc, Duration::from_secs(1), |e| {
        matches!(e, Envelope::Pong)
    })
    .await;
    assert!(pong.is_some());
}

#[tokio::test]
async fn coaching_survives_tts_failure_as_text_only() {
    let mut config = test_config();
    config.tts_timeout_ms = 100;
    let (_, mut collaborators) = common::TestCollab::new(
        ScriptedStt::always("give me your otp"),
        ScriptedModel::default(),
        StubScanner::default(),
    );
    collaborators.tts = std::sync::Arc::new(decoy_broker::collab::fakes::NullTts::failing());
    let registry = CallRegistry::new(config.clone(), collaborators);
    let id = call_id("tts-fail-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    feed_voiced(&handle, Role::Scammer, sc_leg, 900, 4).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let seen = envelopes.lock().unwrap();
    let coaching = seen
        .iter()
        .find(|e| matches!(e, Envelope::Coaching { .. }))
        .expect("coaching should still arrive without audio");
    match coaching {
        Envelope::Coaching { audio, .. } => assert!(audio.is_none()),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn llm_schema_violation_keeps_stage_a_results() {
    let config = test_config();
    let model = ScriptedModel::default();
    model.push_extraction(Ok(serde_json::json!({"surprise": "not the schema"})));
    let (_, collaborators) = common::TestCollab::new(
        ScriptedStt::always("account number 123456789 please"),
        model,
        StubScanner::default(),
    );
    let registry = CallRegistry::new(config.clone(), collaborators);
    let id = call_id("schema-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    feed_voiced(&handle, Role::Scammer, sc_leg, 900, 4).await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    let seen = envelopes.lock().unwrap();
    assert!(
        seen.iter().any(|e| match e {
            Envelope::Intelligence { entities_delta, .. } => entities_delta
                .iter()
                .any(|en| en.kind == EntityKind::BankAccount && en.value == "123456789"),
            _ => false,
        }),
        "stage A extraction was lost when the model output failed validation"
    );
}

#[tokio::test]
async fn fatal_llm_failure_disables_lane_but_not_relay() {
    let config = test_config();
    let model = ScriptedModel::default();
    model.push_extraction(Err(CollabError::Fatal("bad credentials".to_string())));
    let (_, collaborators) = common::TestCollab::new(
        ScriptedStt::always("verify your upi now"),
        model,
        StubScanner::default(),
    );
    let registry = CallRegistry::new(config.clone(), collaborators);
    let id = call_id("fatal-1");
    let (handle, rx_op, sc_leg) = active_call(&registry, &id, &config).await;
    let envelopes = collect(rx_op);

    feed_voiced(&handle, Role::Scammer, sc_leg, 900, 4).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Stage A still produced intelligence, audio still relayed, and the
    // session stayed alive.
    let seen = envelopes.lock().unwrap();
    assert!(seen.iter().any(|e| matches!(e, Envelope::Audio { .. })));
    assert!(seen.iter().any(|e| matches!(e, Envelope::Intelligence { .. })));
    assert_eq!(handle.status().await.unwrap().state, SessionState::Active);
}
