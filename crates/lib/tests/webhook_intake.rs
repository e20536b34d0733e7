//! Integration tests: real webhook server on a loopback port, driven with reqwest.
//! Telegram's Bot API is replaced by a local recorder; the reasoning backend by a fake.

use async_trait::async_trait;
use axum::{body::Bytes, http::Uri, Json, Router};
use clawgate::backend::{BackendRequest, BackendResponse, ReasoningBackend};
use clawgate::channels::{ChannelAdapter, ChannelRegistry, FeishuChannel, TelegramChannel};
use clawgate::config::{FeishuChannelConfig, TelegramChannelConfig};
use clawgate::dedup::RecentlySeen;
use clawgate::dispatcher::{spawn_workers, DispatchPolicy, Dispatcher};
use clawgate::gateway::router;
use clawgate::intake::{intake_queue, IntakeQueue};
use clawgate::session::SessionStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const SECRET: &str = "hook-secret";

/// Requests received by the fake Bot API: (path, json body).
type Recorded = Arc<Mutex<Vec<(String, Value)>>>;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

async fn fake_bot_api() -> (String, Recorded) {
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    let app = Router::new().fallback(move |uri: Uri, body: Bytes| {
        let sink = sink.clone();
        async move {
            let v: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            sink.lock().unwrap().push((uri.path().to_string(), v));
            Json(json!({ "ok": true, "result": {} }))
        }
    });
    (serve(app).await, recorded)
}

#[derive(Default)]
struct EchoBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl ReasoningBackend for EchoBackend {
    async fn run(&self, req: BackendRequest) -> clawgate::Result<BackendResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BackendResponse {
            output: format!("re: {}", req.prompt),
        })
    }

    async fn check(&self) -> clawgate::Result<()> {
        Ok(())
    }
}

fn telegram(api_base: &str) -> Arc<TelegramChannel> {
    let cfg = TelegramChannelConfig {
        enabled: true,
        webhook_secret: Some(SECRET.to_string()),
        api_base: Some(api_base.to_string()),
        ..Default::default()
    };
    Arc::new(TelegramChannel::from_config(&cfg, Some("test-token".to_string())).expect("telegram"))
}

fn update(update_id: i64, text: &str) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "chat": { "id": 42 },
            "from": { "id": 7 },
            "text": text
        }
    })
}

async fn post_update(client: &reqwest::Client, base: &str, body: &Value, secret: &str) -> reqwest::StatusCode {
    client
        .post(format!("{}/telegram/webhook", base))
        .header("X-Telegram-Bot-Api-Secret-Token", secret)
        .json(body)
        .send()
        .await
        .expect("post update")
        .status()
}

async fn gateway_with(adapter: Arc<dyn ChannelAdapter>, intake: IntakeQueue) -> String {
    serve(router(vec![adapter], intake)).await
}

#[tokio::test]
async fn duplicate_delivery_yields_one_backend_call_and_one_reply() {
    let (api_base, sent) = fake_bot_api().await;
    let tg = telegram(&api_base);
    let registry = Arc::new(ChannelRegistry::new());
    registry.register(tg.clone()).await;
    let backend = Arc::new(EchoBackend::default());
    let (intake, rx) = intake_queue(16);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(SessionStore::new(Duration::from_secs(600))),
        registry,
        backend.clone(),
        RecentlySeen::new(Duration::from_secs(900), 1000),
        DispatchPolicy::default(),
    ));
    let cancel = CancellationToken::new();
    let workers = spawn_workers(dispatcher, rx, 2, cancel.clone());
    let base = gateway_with(tg, intake).await;

    let client = reqwest::Client::new();
    let body = update(500, "hello");
    assert_eq!(post_update(&client, &base, &body, SECRET).await, reqwest::StatusCode::OK);
    assert_eq!(post_update(&client, &base, &body, SECRET).await, reqwest::StatusCode::OK);

    let deadline = Instant::now() + Duration::from_secs(5);
    while sent.lock().unwrap().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    let sent = sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1, "replies: {:?}", sent);
    assert_eq!(sent[0].0, "/bottest-token/sendMessage");
    assert_eq!(sent[0].1["chat_id"], json!("42"));
    assert_eq!(sent[0].1["text"], json!("re: hello"));

    cancel.cancel();
    for w in workers {
        w.await.expect("worker");
    }
}

#[tokio::test]
async fn full_intake_rejects_promptly() {
    let (api_base, _sent) = fake_bot_api().await;
    let (intake, _rx) = intake_queue(1);
    let base = gateway_with(telegram(&api_base), intake).await;
    let client = reqwest::Client::new();

    assert_eq!(
        post_update(&client, &base, &update(1, "first"), SECRET).await,
        reqwest::StatusCode::OK
    );
    let started = Instant::now();
    assert_eq!(
        post_update(&client, &base, &update(2, "second"), SECRET).await,
        reqwest::StatusCode::TOO_MANY_REQUESTS
    );
    assert!(started.elapsed() < Duration::from_secs(2));

    let health: Value = client
        .get(format!("{}/", base))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["queueDepth"], json!(1));
    assert_eq!(health["channels"], json!(["telegram"]));
}

#[tokio::test]
async fn wrong_secret_is_forbidden() {
    let (api_base, _sent) = fake_bot_api().await;
    let (intake, _rx) = intake_queue(4);
    let base = gateway_with(telegram(&api_base), intake.clone()).await;
    let client = reqwest::Client::new();
    assert_eq!(
        post_update(&client, &base, &update(3, "hi"), "guess").await,
        reqwest::StatusCode::FORBIDDEN
    );
    assert_eq!(intake.depth(), 0);
}

#[tokio::test]
async fn feishu_url_verification_is_answered_inline() {
    let cfg = FeishuChannelConfig {
        enabled: true,
        app_id: Some("cli_test".to_string()),
        verification_token: Some("vt".to_string()),
        domain: Some("http://127.0.0.1:9".to_string()),
        ..Default::default()
    };
    let feishu = Arc::new(FeishuChannel::from_config(&cfg, Some("app-secret".to_string())).expect("feishu"));
    let (intake, _rx) = intake_queue(4);
    let base = gateway_with(feishu, intake.clone()).await;

    let res = reqwest::Client::new()
        .post(format!("{}/feishu/webhook", base))
        .json(&json!({ "type": "url_verification", "challenge": "abc", "token": "vt" }))
        .send()
        .await
        .expect("post");
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let v: Value = res.json().await.expect("json");
    assert_eq!(v, json!({ "challenge": "abc" }));
    assert_eq!(intake.depth(), 0);
}
