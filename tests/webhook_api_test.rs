//! Webhook and call management API integration tests

mod common;

use axum::http::StatusCode;
use common::{eventually, TestApp, FALLBACK};
use dialtone::domain::call::repository::CallRepository;
use dialtone::domain::call::value_object::CallPhase;
use dialtone::domain::shared::value_objects::CallId;
use serde_json::json;

#[tokio::test]
async fn test_collection_call_retry_then_success() {
    let app = TestApp::new();

    let (status, json) = app
        .post_form(
            "/webhooks/incoming-call?scenario=paypal",
            "CallSid=CA100&From=%2B15550001111&To=%2B15550002222",
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["action"], "gather");
    assert_eq!(json["data"]["stage_key"], "paypal");
    assert_eq!(json["data"]["gather"]["num_digits"], 6);

    // wrong length
    let (status, json) = app
        .post_form("/webhooks/dtmf?stage=paypal", "CallSid=CA100&Digits=12345")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["status"], "retry");
    assert_eq!(json["data"]["remaining"], 2);
    assert_eq!(json["data"]["action"], "gather");

    let (_, json) = app
        .post_form("/webhooks/dtmf?stage=paypal", "CallSid=CA100&Digits=123456")
        .await;
    assert_eq!(json["data"]["status"], "complete");
    assert_eq!(json["data"]["digit_count"], 6);
    assert_eq!(json["data"]["attempts"], 2);

    // provider redelivers the accepted entry: same answer, no new audit row
    let (_, replay) = app
        .post_form("/webhooks/dtmf?stage=paypal", "CallSid=CA100&Digits=123456")
        .await;
    assert_eq!(replay["data"]["status"], "complete");

    let call_id = CallId::parse("CA100").unwrap();
    let inputs = app.repository.call_inputs(&call_id).await;
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].value, "123456");
    assert_eq!(inputs[0].attempts, 2);

    let (_, json) = app
        .post_form("/webhooks/status", "CallSid=CA100&CallStatus=completed&CallDuration=31")
        .await;
    assert_eq!(json["data"]["finalized"], true);
    assert_eq!(json["data"]["phase"], "COMPLETED");

    let stored = app.repository.get_call(&call_id).await.unwrap().unwrap();
    assert_eq!(stored.outcome, Some(CallPhase::Success));
    assert!(stored.duration_seconds.is_some());

    app.shutdown().await;
}

#[tokio::test]
async fn test_three_invalid_entries_fail_and_hang_up() {
    let app = TestApp::new();
    app.post_form("/webhooks/incoming-call?scenario=paypal", "CallSid=CA200")
        .await;

    let mut last = json!(null);
    for digits in ["1", "22", "333"] {
        let (_, json) = app
            .post_form(
                "/webhooks/dtmf?stage=paypal",
                &format!("CallSid=CA200&Digits={}", digits),
            )
            .await;
        last = json;
    }
    assert_eq!(last["data"]["status"], "failed");
    assert_eq!(last["data"]["action"], "hangup");
    assert_eq!(last["data"]["remaining"], 0);

    // finalized on exhaustion; later keypad input is ignored
    let (_, json) = app
        .post_form("/webhooks/dtmf", "CallSid=CA200&Digits=123456")
        .await;
    assert_eq!(json["data"]["status"], "ignored");

    let call_id = CallId::parse("CA200").unwrap();
    let stored = app.repository.get_call(&call_id).await.unwrap().unwrap();
    assert_eq!(stored.outcome, Some(CallPhase::Fail));
    assert_eq!(stored.phase, CallPhase::Completed);
    assert_eq!(
        stored.termination_reason.as_deref(),
        Some("input_exhausted")
    );

    app.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_keystroke_counted_once() {
    let app = TestApp::new();
    app.post_form("/webhooks/incoming-call?scenario=pin", "CallSid=CA300")
        .await;

    for (digit, event) in [("1", "e1"), ("2", "e2"), ("2", "e2"), ("3", "e3")] {
        let (_, json) = app
            .post_form(
                &format!("/webhooks/dtmf?stage=pin&partial=true&event_id={}", event),
                &format!("CallSid=CA300&Digits={}", digit),
            )
            .await;
        assert_eq!(json["data"]["status"], "buffering");
    }

    // "#" terminates the entry; the duplicate "2" was dropped, so four keys
    let (_, json) = app
        .post_form(
            "/webhooks/dtmf?stage=pin&partial=true&event_id=e4",
            "CallSid=CA300&Digits=4%23",
        )
        .await;
    assert_eq!(json["data"]["status"], "complete");
    assert_eq!(json["data"]["digit_count"], 4);
    assert_eq!(json["data"]["attempts"], 1);

    app.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_terminal_status_finalizes_once() {
    let app = TestApp::new();
    app.post_form("/webhooks/incoming-call", "CallSid=CA400").await;

    let (_, first) = app
        .post_form("/webhooks/status", "CallSid=CA400&CallStatus=completed")
        .await;
    let (status, second) = app
        .post_form("/webhooks/status", "CallSid=CA400&CallStatus=completed")
        .await;
    assert_eq!(first["data"]["finalized"], true);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["finalized"], false);
    assert_eq!(second["data"]["applied"], false);

    let messaging = app.messaging.clone();
    let delivered = eventually(|| {
        let messaging = messaging.clone();
        async move {
            messaging
                .delivered()
                .await
                .iter()
                .any(|m| m.text.contains("CA400 ended"))
        }
    })
    .await;
    assert!(delivered);

    let completed: Vec<_> = app
        .messaging
        .delivered()
        .await
        .into_iter()
        .filter(|m| m.text == "Call CA400: completed")
        .collect();
    assert_eq!(completed.len(), 1);

    app.shutdown().await;
}

#[tokio::test]
async fn test_unknown_session_acknowledged_without_success() {
    let app = TestApp::new();

    let (status, json) = app
        .post_form("/webhooks/status", "CallSid=CA-missing&CallStatus=ringing")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("CA-missing"));

    app.shutdown().await;
}

#[tokio::test]
async fn test_missing_fields_rejected() {
    let app = TestApp::new();

    let (status, json) = app
        .post_form("/webhooks/status", "CallStatus=ringing")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);

    let (status, _) = app
        .post_form("/webhooks/incoming-call?type=carrier-pigeon", "CallSid=CA1")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.post_json("/calls", json!({"origin": "+15550002222"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    app.shutdown().await;
}

#[tokio::test]
async fn test_conversation_degrades_to_fallback() {
    let app = TestApp::new();

    let (_, json) = app
        .post_form("/webhooks/incoming-call?type=conversational", "CallSid=CA500")
        .await;
    assert_eq!(json["data"]["action"], "continue");

    let (_, json) = app
        .post_form("/webhooks/speech", "CallSid=CA500&SpeechResult=hello")
        .await;
    assert_eq!(json["data"]["degraded"], false);
    assert_eq!(json["data"]["text"], "You said: hello (turn 1)");

    app.completion.set_unavailable(true);
    for _ in 0..3 {
        let (status, json) = app
            .post_form("/webhooks/speech", "CallSid=CA500&SpeechResult=anyone%3F")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["degraded"], true);
        assert_eq!(json["data"]["text"], FALLBACK);
    }

    let (_, health) = app.get("/health").await;
    assert_eq!(health["data"]["completion_breaker"]["state"], "OPEN");
    assert_eq!(health["data"]["status"], "degraded");

    app.shutdown().await;
}

#[tokio::test]
async fn test_outbound_call_lifecycle() {
    let app = TestApp::new();

    let (status, json) = app
        .post_json(
            "/calls",
            json!({
                "call_type": "verification",
                "destination": "+15550001111",
                "origin": "+15550002222",
                "metadata": {"expected_code": "482913", "chat_id": "chat-7"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let call_id = json["data"]["call_id"].as_str().unwrap().to_string();
    assert!(call_id.starts_with("SB"));

    let placed = app.telephony.placed_calls().await;
    assert_eq!(placed.len(), 1);
    assert!(placed[0].callback_url.ends_with("/webhooks/incoming-call"));

    let (_, list) = app.get("/calls").await;
    assert_eq!(list["data"]["total"], 1);

    let (_, json) = app
        .post_form("/webhooks/incoming-call", &format!("CallSid={}", call_id))
        .await;
    assert_eq!(json["data"]["action"], "gather");

    // wrong code is a retry, the right one completes and hangs up
    let (_, json) = app
        .post_form("/webhooks/dtmf", &format!("CallSid={}&Digits=111111", call_id))
        .await;
    assert_eq!(json["data"]["status"], "retry");
    let (_, json) = app
        .post_form("/webhooks/dtmf", &format!("CallSid={}&Digits=482913", call_id))
        .await;
    assert_eq!(json["data"]["status"], "complete");
    assert_eq!(json["data"]["action"], "hangup");

    let (status, json) = app
        .post_json(&format!("/calls/{}/hangup", call_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["cleaned_up"], true);

    let (_, json) = app.get(&format!("/calls/{}", call_id)).await;
    assert_eq!(json["data"]["source"], "stored");
    assert_eq!(json["data"]["call"]["phase"], "COMPLETED");
    assert_eq!(json["data"]["call"]["outcome"], "SUCCESS");

    let (_, list) = app.get("/calls").await;
    assert_eq!(list["data"]["total"], 0);

    app.shutdown().await;
}

#[tokio::test]
async fn test_outbound_rejected_without_credentials() {
    let app = TestApp::with_unconfigured_telephony();

    let (status, json) = app
        .post_json(
            "/calls",
            json!({"destination": "+15550001111", "origin": "+15550002222"}),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);

    app.shutdown().await;
}
