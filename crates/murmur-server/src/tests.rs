use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use httpmock::prelude::*;
use murmur_ai::{ChatMessage, CompletionClient, MurmurAiError};
use murmur_slack::{Responder, ResponderConfig, SlackApiClient};
use murmur_store::{MessageRole, MessageStore, SqliteMessageStore, StoredMessage};
use serde_json::json;
use sha2::Sha256;
use tempfile::TempDir;
use tokio::time::sleep;

use crate::event::EventPayload;
use crate::pipeline::{Pipeline, PipelineConfig, PipelineOutcome};
use crate::server::{build_webhook_router, current_unix_timestamp, AppState};
use crate::supervisor::TaskSupervisor;

const TEST_SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
const BOT_USER_ID: &str = "UBOT";

/// Completion double with canned outputs. A `None` script panics when
/// that entry point is reached, which pins down routing: the document
/// path must never call `generate` and vice versa.
struct ScriptedCompletion {
    reply: Option<String>,
    analysis: Option<String>,
    generate_error: bool,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
    documents: Mutex<Vec<(String, String)>>,
}

impl ScriptedCompletion {
    fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            analysis: None,
            generate_error: false,
            prompts: Mutex::new(Vec::new()),
            documents: Mutex::new(Vec::new()),
        }
    }

    fn analyzing(analysis: &str) -> Self {
        Self {
            reply: None,
            analysis: Some(analysis.to_string()),
            generate_error: false,
            prompts: Mutex::new(Vec::new()),
            documents: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            reply: None,
            analysis: None,
            generate_error: true,
            prompts: Mutex::new(Vec::new()),
            documents: Mutex::new(Vec::new()),
        }
    }

    fn recorded_prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap().clone()
    }

    fn recorded_documents(&self) -> Vec<(String, String)> {
        self.documents.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, MurmurAiError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        if self.generate_error {
            return Err(MurmurAiError::InvalidResponse(
                "scripted generate failure".to_string(),
            ));
        }
        Ok(self
            .reply
            .clone()
            .unwrap_or_else(|| panic!("generate called but no reply was scripted")))
    }

    async fn analyze_document(
        &self,
        pdf_base64: &str,
        instruction: &str,
    ) -> Result<String, MurmurAiError> {
        self.documents
            .lock()
            .unwrap()
            .push((pdf_base64.to_string(), instruction.to_string()));
        Ok(self
            .analysis
            .clone()
            .unwrap_or_else(|| panic!("analyze_document called but no analysis was scripted")))
    }
}

struct Harness {
    _db_dir: TempDir,
    store: Arc<SqliteMessageStore>,
    completion: Arc<ScriptedCompletion>,
    pipeline: Arc<Pipeline>,
}

fn harness(slack_base: &str, completion: ScriptedCompletion) -> Harness {
    let db_dir = tempfile::tempdir().expect("tempdir");
    let store =
        Arc::new(SqliteMessageStore::new(db_dir.path().join("history.db")).expect("store"));
    let client = SlackApiClient::new(slack_base.to_string(), "xoxb-test".to_string(), 3_000)
        .expect("client");
    let responder = Responder::new(
        client,
        ResponderConfig {
            max_update_retries: 1,
            retry_delay_ms: 5,
            placeholder_text: "Generating a reply...".to_string(),
        },
    );
    let completion = Arc::new(completion);
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        completion.clone(),
        responder,
        PipelineConfig {
            bot_user_id: BOT_USER_ID.to_string(),
        },
    ));
    Harness {
        _db_dir: db_dir,
        store,
        completion,
        pipeline,
    }
}

fn conversational_event(event_type: &str, ts: &str, thread_ts: Option<&str>, text: &str) -> EventPayload {
    EventPayload {
        event_type: event_type.to_string(),
        subtype: None,
        user: Some("U1".to_string()),
        text: Some(text.to_string()),
        channel: Some("C1".to_string()),
        ts: Some(ts.to_string()),
        thread_ts: thread_ts.map(str::to_string),
        files: Vec::new(),
    }
}

#[tokio::test]
async fn mention_posts_placeholder_updates_it_and_persists_both_turns() {
    let slack = MockServer::start_async().await;
    let post = slack
        .mock_async(|when, then| {
            when.method(POST).path("/chat.postMessage").json_body_includes(
                r#"{"channel":"C1","text":"Generating a reply...","thread_ts":"100.1"}"#,
            );
            then.status(200)
                .json_body(json!({"ok": true, "channel": "C1", "ts": "100.9"}));
        })
        .await;
    let update = slack
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat.update")
                .json_body_includes(r#"{"channel":"C1","ts":"100.9","text":"hi from the model"}"#);
            then.status(200).json_body(json!({"ok": true, "ts": "100.9"}));
        })
        .await;

    let harness = harness(&slack.base_url(), ScriptedCompletion::replying("hi from the model"));
    let outcome = harness
        .pipeline
        .process_event(conversational_event("app_mention", "100.1", None, "hello"))
        .await
        .expect("mention is answered");

    assert_eq!(
        outcome,
        PipelineOutcome::Replied {
            placeholder_ts: "100.9".to_string()
        }
    );
    post.assert_async().await;
    update.assert_async().await;

    // A root mention opens a thread keyed by its own ts.
    let prompts = harness.completion.recorded_prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0], vec![ChatMessage::user("hello")]);

    let rows = harness.store.list_thread("100.1").await.expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].ts, "100.1");
    assert_eq!(rows[0].role, MessageRole::User);
    assert_eq!(rows[0].text, "hello");
    assert_eq!(rows[1].ts, "100.9");
    assert_eq!(rows[1].role, MessageRole::Assistant);
    assert_eq!(rows[1].text, "hi from the model");
    assert_eq!(rows[1].thread_ts.as_deref(), Some("100.1"));
}

#[tokio::test]
async fn thread_message_carries_full_history_into_the_prompt() {
    let slack = MockServer::start_async().await;
    slack
        .mock_async(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .json_body(json!({"ok": true, "channel": "C1", "ts": "101.0"}));
        })
        .await;
    slack
        .mock_async(|when, then| {
            when.method(POST).path("/chat.update");
            then.status(200).json_body(json!({"ok": true, "ts": "101.0"}));
        })
        .await;

    let harness = harness(&slack.base_url(), ScriptedCompletion::replying("a2"));
    harness
        .store
        .append(&StoredMessage {
            channel_id: "C1".to_string(),
            ts: "90.0".to_string(),
            thread_ts: None,
            text: "q1".to_string(),
            role: MessageRole::User,
        })
        .await
        .expect("seed user turn");
    harness
        .store
        .append(&StoredMessage {
            channel_id: "C1".to_string(),
            ts: "90.5".to_string(),
            thread_ts: Some("90.0".to_string()),
            text: "a1".to_string(),
            role: MessageRole::Assistant,
        })
        .await
        .expect("seed assistant turn");

    let outcome = harness
        .pipeline
        .process_event(conversational_event("message", "100.1", Some("90.0"), "q2"))
        .await
        .expect("tracked thread is answered");
    assert!(matches!(outcome, PipelineOutcome::Replied { .. }));

    let prompts = harness.completion.recorded_prompts();
    assert_eq!(
        prompts[0],
        vec![
            ChatMessage::user("q1"),
            ChatMessage::assistant("a1"),
            ChatMessage::user("q2"),
        ]
    );
}

#[tokio::test]
async fn message_in_untracked_thread_is_dropped_without_side_effects() {
    let slack = MockServer::start_async().await;
    let any_call = slack
        .mock_async(|when, then| {
            when.method(POST);
            then.status(200).json_body(json!({"ok": true, "ts": "1.0"}));
        })
        .await;

    let harness = harness(&slack.base_url(), ScriptedCompletion::replying("unused"));
    let outcome = harness
        .pipeline
        .process_event(conversational_event("message", "100.1", None, "anyone here?"))
        .await
        .expect("drop is not an error");

    assert_eq!(outcome, PipelineOutcome::Ignored("untracked thread"));
    any_call.assert_hits_async(0).await;
    assert!(harness.completion.recorded_prompts().is_empty());
    assert!(harness.store.list_thread("100.1").await.expect("rows").is_empty());
}

#[tokio::test]
async fn own_bot_events_are_dropped_before_any_io() {
    let slack = MockServer::start_async().await;
    let any_call = slack
        .mock_async(|when, then| {
            when.method(POST);
            then.status(200).json_body(json!({"ok": true, "ts": "1.0"}));
        })
        .await;

    let harness = harness(&slack.base_url(), ScriptedCompletion::replying("unused"));
    let mut event = conversational_event("app_mention", "100.1", None, "echo");
    event.user = Some(BOT_USER_ID.to_string());

    let outcome = harness.pipeline.process_event(event).await.expect("drop");
    assert!(matches!(outcome, PipelineOutcome::Ignored(_)));
    any_call.assert_hits_async(0).await;
    assert!(harness.completion.recorded_prompts().is_empty());
}

#[tokio::test]
async fn completion_failure_turns_the_placeholder_into_an_apology() {
    let slack = MockServer::start_async().await;
    let post = slack
        .mock_async(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .json_body(json!({"ok": true, "channel": "C1", "ts": "100.9"}));
        })
        .await;
    let apology = slack
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat.update")
                .body_includes("Sorry");
            then.status(200).json_body(json!({"ok": true, "ts": "100.9"}));
        })
        .await;

    let harness = harness(&slack.base_url(), ScriptedCompletion::failing());
    let error = harness
        .pipeline
        .process_event(conversational_event("app_mention", "100.1", None, "hello"))
        .await
        .expect_err("completion failure is terminal for the event");

    assert!(error.to_string().contains("completion request failed"));
    post.assert_async().await;
    apology.assert_async().await;
    // Failed turns leave no trace in the history.
    assert!(harness.store.list_thread("100.1").await.expect("rows").is_empty());
}

fn pdf_event(ts: &str, text: &str, download_url: &str) -> EventPayload {
    let mut event = conversational_event("message", ts, None, text);
    event.files = vec![crate::event::FileAttachment {
        mimetype: Some("application/pdf".to_string()),
        name: Some("report.pdf".to_string()),
        url_private: None,
        url_private_download: Some(download_url.to_string()),
    }];
    event
}

#[tokio::test]
async fn pdf_attachment_is_analyzed_and_posted_as_a_new_message() {
    let slack = MockServer::start_async().await;
    let download = slack
        .mock_async(|when, then| {
            when.method(GET)
                .path("/files/report.pdf")
                .header("authorization", "Bearer xoxb-test");
            then.status(200).body(b"%PDF-1.4 test bytes");
        })
        .await;
    let post = slack
        .mock_async(|when, then| {
            when.method(POST).path("/chat.postMessage").json_body_includes(
                r#"{"channel":"C1","text":"three key findings","thread_ts":"100.1"}"#,
            );
            then.status(200)
                .json_body(json!({"ok": true, "channel": "C1", "ts": "101.0"}));
        })
        .await;

    let harness = harness(
        &slack.base_url(),
        ScriptedCompletion::analyzing("three key findings"),
    );
    let url = format!("{}/files/report.pdf", slack.base_url());
    let outcome = harness
        .pipeline
        .process_event(pdf_event("100.1", "what does this say?", &url))
        .await
        .expect("pdf is analyzed");

    assert_eq!(
        outcome,
        PipelineOutcome::DocumentAnalyzed {
            posted_ts: "101.0".to_string()
        }
    );
    download.assert_async().await;
    post.assert_async().await;

    let documents = harness.completion.recorded_documents();
    assert_eq!(documents.len(), 1);
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&documents[0].0)
        .expect("valid base64");
    assert_eq!(decoded, b"%PDF-1.4 test bytes");
    assert_eq!(documents[0].1, "what does this say?");

    let rows = harness.store.list_thread("100.1").await.expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].text, "[shared file: report.pdf]");
    assert_eq!(rows[0].role, MessageRole::User);
    assert_eq!(rows[1].text, "three key findings");
    assert_eq!(rows[1].role, MessageRole::Assistant);
}

#[tokio::test]
async fn pdf_download_failure_posts_a_failure_notice() {
    let slack = MockServer::start_async().await;
    slack
        .mock_async(|when, then| {
            when.method(GET).path("/files/report.pdf");
            then.status(500);
        })
        .await;
    let notice = slack
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat.postMessage")
                .body_includes("could not analyze");
            then.status(200)
                .json_body(json!({"ok": true, "channel": "C1", "ts": "101.0"}));
        })
        .await;

    let harness = harness(&slack.base_url(), ScriptedCompletion::analyzing("unused"));
    let url = format!("{}/files/report.pdf", slack.base_url());
    let error = harness
        .pipeline
        .process_event(pdf_event("100.1", "", &url))
        .await
        .expect_err("download failure is terminal for the event");

    assert!(error.to_string().contains("download"));
    notice.assert_async().await;
    assert!(harness.store.list_thread("100.1").await.expect("rows").is_empty());
}

// --- webhook endpoint ---

fn sign(secret: &str, timestamp: u64, body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("v0:{timestamp}:{body}").as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut rendered = String::with_capacity(3 + digest.len() * 2);
    rendered.push_str("v0=");
    for byte in digest {
        rendered.push_str(&format!("{byte:02x}"));
    }
    rendered
}

async fn spawn_app(state: Arc<AppState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, build_webhook_router(state))
            .await
            .expect("test server");
    });
    format!("http://{addr}")
}

struct HttpHarness {
    inner: Harness,
    supervisor: Arc<TaskSupervisor>,
    base_url: String,
    http: reqwest::Client,
}

async fn http_harness(slack_base: &str, completion: ScriptedCompletion) -> HttpHarness {
    let inner = harness(slack_base, completion);
    let supervisor = Arc::new(TaskSupervisor::new());
    let state = Arc::new(AppState {
        signing_secret: TEST_SECRET.to_string(),
        pipeline: inner.pipeline.clone(),
        supervisor: supervisor.clone(),
    });
    let base_url = spawn_app(state).await;
    HttpHarness {
        inner,
        supervisor,
        base_url,
        http: reqwest::Client::new(),
    }
}

impl HttpHarness {
    async fn post_signed(&self, body: &str) -> reqwest::Response {
        let timestamp = current_unix_timestamp();
        self.post_raw(body, Some((sign(TEST_SECRET, timestamp, body), timestamp)))
            .await
    }

    async fn post_raw(
        &self,
        body: &str,
        signature: Option<(String, u64)>,
    ) -> reqwest::Response {
        let mut request = self
            .http
            .post(format!("{}/slack/events", self.base_url))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some((signature, timestamp)) = signature {
            request = request
                .header("x-slack-signature", signature)
                .header("x-slack-request-timestamp", timestamp.to_string());
        }
        request.send().await.expect("request reaches test server")
    }

    async fn wait_for_settled_tasks(&self, expected: u64) {
        for _ in 0..200 {
            let snapshot = self.supervisor.snapshot();
            if snapshot.completed + snapshot.failed >= expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("background tasks did not settle in time");
    }
}

#[tokio::test]
async fn unsigned_webhook_is_rejected_with_401() {
    let slack = MockServer::start_async().await;
    let harness = http_harness(&slack.base_url(), ScriptedCompletion::replying("unused")).await;

    let response = harness
        .post_raw(r#"{"type":"url_verification","challenge":"c"}"#, None)
        .await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn wrong_secret_signature_is_rejected_with_401() {
    let slack = MockServer::start_async().await;
    let harness = http_harness(&slack.base_url(), ScriptedCompletion::replying("unused")).await;

    let body = r#"{"type":"url_verification","challenge":"c"}"#;
    let timestamp = current_unix_timestamp();
    let response = harness
        .post_raw(body, Some((sign("other-secret", timestamp, body), timestamp)))
        .await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn stale_timestamp_is_rejected_even_with_a_valid_signature() {
    let slack = MockServer::start_async().await;
    let harness = http_harness(&slack.base_url(), ScriptedCompletion::replying("unused")).await;

    let body = r#"{"type":"url_verification","challenge":"c"}"#;
    let stale = current_unix_timestamp() - 301;
    let response = harness
        .post_raw(body, Some((sign(TEST_SECRET, stale, body), stale)))
        .await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn malformed_body_with_a_valid_signature_is_a_400() {
    let slack = MockServer::start_async().await;
    let harness = http_harness(&slack.base_url(), ScriptedCompletion::replying("unused")).await;

    let response = harness.post_signed("{not json").await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn url_verification_echoes_the_challenge() {
    let slack = MockServer::start_async().await;
    let harness = http_harness(&slack.base_url(), ScriptedCompletion::replying("unused")).await;

    let response = harness
        .post_signed(r#"{"type":"url_verification","challenge":"abc123"}"#)
        .await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["challenge"], "abc123");
}

#[tokio::test]
async fn unsupported_payload_type_is_a_400() {
    let slack = MockServer::start_async().await;
    let harness = http_harness(&slack.base_url(), ScriptedCompletion::replying("unused")).await;

    let response = harness.post_signed(r#"{"type":"app_rate_limited"}"#).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn event_callback_acks_immediately_and_replies_in_the_background() {
    let slack = MockServer::start_async().await;
    let post = slack
        .mock_async(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .json_body(json!({"ok": true, "channel": "C1", "ts": "100.9"}));
        })
        .await;
    let update = slack
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat.update")
                .json_body_includes(r#"{"channel":"C1","ts":"100.9","text":"deferred reply"}"#);
            then.status(200).json_body(json!({"ok": true, "ts": "100.9"}));
        })
        .await;

    let harness =
        http_harness(&slack.base_url(), ScriptedCompletion::replying("deferred reply")).await;
    let body = json!({
        "type": "event_callback",
        "event_id": "Ev123",
        "event": {
            "type": "app_mention",
            "user": "U1",
            "text": "hello there",
            "channel": "C1",
            "ts": "100.1",
        },
    })
    .to_string();

    let response = harness.post_signed(&body).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-slack-no-retry")
            .and_then(|value| value.to_str().ok()),
        Some("1")
    );

    harness.wait_for_settled_tasks(1).await;
    let snapshot = harness.supervisor.snapshot();
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.failed, 0);

    post.assert_async().await;
    update.assert_async().await;
    let rows = harness.inner.store.list_thread("100.1").await.expect("rows");
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn background_failures_are_counted_and_do_not_affect_the_ack() {
    let slack = MockServer::start_async().await;
    slack
        .mock_async(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(500);
        })
        .await;
    slack
        .mock_async(|when, then| {
            when.method(POST).path("/chat.update");
            then.status(500);
        })
        .await;

    let harness =
        http_harness(&slack.base_url(), ScriptedCompletion::replying("unused")).await;
    let body = json!({
        "type": "event_callback",
        "event_id": "Ev124",
        "event": {
            "type": "app_mention",
            "user": "U1",
            "text": "hello",
            "channel": "C1",
            "ts": "100.1",
        },
    })
    .to_string();

    let response = harness.post_signed(&body).await;
    assert_eq!(response.status(), 200);

    harness.wait_for_settled_tasks(1).await;
    let snapshot = harness.supervisor.snapshot();
    assert_eq!(snapshot.failed, 1);
}
