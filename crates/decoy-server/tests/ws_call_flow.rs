//! End-to-end call flow over real WebSockets: the happy path, role
//! collisions, and reconnect within the grace window.

mod common;

use common::*;
use decoy_broker::collab::fakes::{ScriptedModel, ScriptedStt, StubScanner};
use decoy_types::{EndReason, EntityKind, Envelope, ErrorCode, Role, Strategy, Tactic};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;

#[tokio::test]
async fn happy_path_scam_call_coaches_the_operator() {
    let (_handles, collaborators) = collab_with(
        ScriptedStt::always("Please share your OTP now"),
        ScriptedModel::default(),
        StubScanner::default(),
    );
    let addr = spawn_app(test_config(), collaborators).await;

    let mut operator = ws_connect(addr, "C1", "operator").await;
    let connected = recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Connected { .. })
    })
    .await
    .expect("operator connected envelope");
    assert!(matches!(
        connected,
        Envelope::Connected {
            role: Role::Operator,
            peer_present: false,
            ..
        }
    ));

    let mut scammer = ws_connect(addr, "C1", "scammer").await;
    recv_matching(&mut scammer, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Connected { .. })
    })
    .await
    .expect("scammer connected envelope");

    recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::PeerJoined { role: Role::Scammer })
    })
    .await
    .expect("operator peer_joined");

    // Four seconds of speech in one-second chunks.
    for _ in 0..4 {
        send_envelope(&mut scammer, &audio_envelope(voiced_wav(1000))).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let seen = collect_for(&mut operator, Duration::from_secs(3)).await;

    assert!(
        seen.iter().any(|e| matches!(
            e,
            Envelope::Audio { source: Some(Role::Scammer), .. }
        )),
        "no relayed audio reached the operator"
    );

    let transcript_at = seen
        .iter()
        .position(|e| {
            matches!(e, Envelope::Transcript { speaker: Role::Scammer, text, .. }
                if text == "Please share your OTP now")
        })
        .expect("transcript envelope");
    let intel_at = seen
        .iter()
        .position(|e| matches!(e, Envelope::Intelligence { .. }))
        .expect("intelligence envelope");
    let coaching_at = seen
        .iter()
        .position(|e| matches!(e, Envelope::Coaching { .. }))
        .expect("coaching envelope");
    assert!(transcript_at < intel_at && intel_at < coaching_at);

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
            assert!(*threat_score >= 0.5);
        }
        _ => unreachable!(),
    }
    match &seen[coaching_at] {
        Envelope::Coaching { strategy, .. } => assert_eq!(*strategy, Strategy::Delay),
        _ => unreachable!(),
    }

    // Operator hangs up the call.
    send_envelope(&mut operator, &Envelope::End).await;
    let op_end = recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::CallEnded { .. })
    })
    .await
    .expect("operator call_ended");
    assert!(matches!(
        op_end,
        Envelope::CallEnded {
            reason: EndReason::Requested,
            ..
        }
    ));
    let sc_end = recv_matching(&mut scammer, Duration::from_secs(2), |e| {
        matches!(e, Envelope::CallEnded { .. })
    })
    .await
    .expect("scammer call_ended");
    assert!(matches!(
        sc_end,
        Envelope::CallEnded {
            reason: EndReason::Requested,
            ..
        }
    ));
}

#[tokio::test]
async fn second_operator_is_refused_and_first_is_unaffected() {
    let (_handles, collaborators) = collab_with(
        ScriptedStt::silent(),
        ScriptedModel::default(),
        StubScanner::default(),
    );
    let addr = spawn_app(test_config(), collaborators).await;

    let mut first = ws_connect(addr, "C2", "operator").await;
    recv_matching(&mut first, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Connected { .. })
    })
    .await
    .expect("first operator connected");

    let mut second = ws_connect(addr, "C2", "operator").await;
    let refusal = recv_matching(&mut second, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Error { .. })
    })
    .await
    .expect("second operator refusal");
    assert!(matches!(
        refusal,
        Envelope::Error {
            code: ErrorCode::RoleOccupied,
            ..
        }
    ));
    // The refused stream closes.
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match second.next().await {
                None => break,
                Some(Err(_)) => break,
                Some(Ok(tokio_tungstenite::tungstenite::protocol::Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "refused socket never closed");

    // The first operator still gets pong for ping.
    send_envelope(&mut first, &Envelope::Ping).await;
    let pong = recv_matching(&mut first, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Pong)
    })
    .await;
    assert!(pong.is_some(), "first operator stopped responding");
}

#[tokio::test]
async fn scammer_reconnect_within_grace_resumes_the_call() {
    let (_handles, collaborators) = collab_with(
        ScriptedStt::silent(),
        ScriptedModel::default(),
        StubScanner::default(),
    );
    let addr = spawn_app(test_config(), collaborators).await;

    let mut operator = ws_connect(addr, "C3", "operator").await;
    let scammer = ws_connect(addr, "C3", "scammer").await;
    recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::PeerJoined { role: Role::Scammer })
    })
    .await
    .expect("peer_joined");

    drop(scammer); // abrupt disconnect

    recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::PeerLeft { role: Role::Scammer })
    })
    .await
    .expect("peer_left after disconnect");

    // Reconnect well within the grace window.
    let mut scammer = ws_connect(addr, "C3", "scammer").await;
    recv_matching(&mut scammer, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Connected { peer_present: true, .. })
    })
    .await
    .expect("reconnected scammer sees peer");

    let rejoined = recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::PeerJoined { role: Role::Scammer })
    })
    .await;
    assert!(rejoined.is_some(), "operator never saw the reconnect");

    // No call_ended was emitted during the drain window.
    let trailing = collect_for(&mut operator, Duration::from_millis(300)).await;
    assert!(
        !trailing
            .iter()
            .any(|e| matches!(e, Envelope::CallEnded { .. })),
        "call ended despite reconnect within grace"
    );
}

#[tokio::test]
async fn invalid_role_is_refused_before_upgrade() {
    let (_handles, collaborators) = collab_with(
        ScriptedStt::silent(),
        ScriptedModel::default(),
        StubScanner::default(),
    );
    let addr = spawn_app(test_config(), collaborators).await;

    let url = format!("ws://{addr}/api/call/connect?call_id=C4&role=supervisor");
    let result = tokio_tungstenite::connect_async(url).await;
    assert!(result.is_err(), "invalid role should refuse the upgrade");
}

#[tokio::test]
async fn malformed_and_unknown_frames_keep_the_leg_alive() {
    let (_handles, collaborators) = collab_with(
        ScriptedStt::silent(),
        ScriptedModel::default(),
        StubScanner::default(),
    );
    let addr = spawn_app(test_config(), collaborators).await;

    let mut operator = ws_connect(addr, "C5", "operator").await;
    recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Connected { .. })
    })
    .await
    .expect("connected");

    operator
        .send(tokio_tungstenite::tungstenite::protocol::Message::Text(
            "this is not json".to_string(),
        ))
        .await
        .unwrap();
    let malformed = recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Error { code: ErrorCode::MalformedEnvelope, .. })
    })
    .await;
    assert!(malformed.is_some());

    operator
        .send(tokio_tungstenite::tungstenite::protocol::Message::Text(
            r#"{"kind":"telemetry","value":1}"#.to_string(),
        ))
        .await
        .unwrap();
    let unknown = recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Error { code: ErrorCode::UnknownEnvelope, .. })
    })
    .await;
    assert!(unknown.is_some());

    // Still alive.
    send_envelope(&mut operator, &Envelope::Ping).await;
    let pong = recv_matching(&mut operator, Duration::from_secs(2), |e| {
        matches!(e, Envelope::Pong)
    })
    .await;
    assert!(pong.is_some());
}
