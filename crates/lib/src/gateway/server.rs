//! Webhook HTTP server: one endpoint per enabled channel plus a health probe.
//!
//! Handlers run verify and normalize, hand the message to the intake queue and answer
//! at once. No backend work happens on the request path.

use crate::channels::{validate_endpoint_path, ChannelAdapter, HandshakeReply, Inbound, RawRequest};
use crate::error::GatewayError;
use crate::intake::IntakeQueue;
use axum::{
    body::Bytes,
    extract::Query,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Build the router for `adapters`, all feeding `intake`. An adapter whose path is
/// unusable or already mounted is left out and logged.
pub fn router(adapters: Vec<Arc<dyn ChannelAdapter>>, intake: IntakeQueue) -> Router {
    let mut mounted = HashSet::new();
    let adapters: Vec<Arc<dyn ChannelAdapter>> = adapters
        .into_iter()
        .filter(|a| {
            let path = a.endpoint_path();
            if let Err(e) = validate_endpoint_path(a.channel(), path) {
                log::error!("gateway: {} webhook not mounted: {}", a.channel(), e);
                return false;
            }
            if !mounted.insert(path.to_string()) {
                log::error!("gateway: {} webhook not mounted: {} is already taken", a.channel(), path);
                return false;
            }
            true
        })
        .collect();
    let names: Vec<String> = adapters.iter().map(|a| a.channel().to_string()).collect();
    let health_intake = intake.clone();
    let mut app = Router::new().route(
        "/",
        get(move || {
            let intake = health_intake.clone();
            let channels = names.clone();
            async move { health_http(&intake, channels) }
        }),
    );
    for adapter in adapters {
        let path = adapter.endpoint_path().to_string();
        log::info!("gateway: {} webhook at {}", adapter.channel(), path);
        let intake = intake.clone();
        let handler = move |method: Method,
                            headers: HeaderMap,
                            Query(query): Query<HashMap<String, String>>,
                            body: Bytes| {
            let adapter = adapter.clone();
            let intake = intake.clone();
            async move {
                let req = raw_request(method, &headers, query, body);
                handle_webhook(adapter.as_ref(), &intake, req)
            }
        };
        app = app.route(&path, get(handler.clone()).post(handler));
    }
    app
}

/// GET / returns a simple health JSON (for probes).
fn health_http(intake: &IntakeQueue, channels: Vec<String>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "channels": channels,
        "queueDepth": intake.depth(),
        "queueCapacity": intake.capacity(),
    }))
}

fn raw_request(method: Method, headers: &HeaderMap, query: HashMap<String, String>, body: Bytes) -> RawRequest {
    let headers = headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    RawRequest {
        method: method.as_str().to_string(),
        headers,
        query,
        body,
    }
}

fn ack(adapter: &dyn ChannelAdapter) -> Response {
    (StatusCode::OK, adapter.ack_body()).into_response()
}

/// Verify, normalize, enqueue. Synchronous: the only queue operation is a non-blocking
/// `try_submit`, so the handler never waits on the dispatcher.
pub(crate) fn handle_webhook(adapter: &dyn ChannelAdapter, intake: &IntakeQueue, req: RawRequest) -> Response {
    let channel = adapter.channel();
    match adapter.verify(&req) {
        Ok(()) => {}
        Err(GatewayError::Auth(reason)) => {
            log::warn!("gateway: {} request rejected: {}", channel, reason);
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(e) => {
            log::warn!("gateway: {} request unreadable, dropped: {}", channel, e);
            return ack(adapter);
        }
    }
    let inbound = match adapter.normalize(&req) {
        Ok(i) => i,
        Err(GatewayError::Auth(reason)) => {
            log::warn!("gateway: {} request rejected: {}", channel, reason);
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(e) => {
            log::warn!("gateway: {} payload dropped: {}", channel, e);
            return ack(adapter);
        }
    };
    match inbound {
        Inbound::Handshake(HandshakeReply::Json(v)) => {
            log::info!("gateway: {} url verification answered", channel);
            Json(v).into_response()
        }
        Inbound::Handshake(HandshakeReply::Text(t)) => {
            log::info!("gateway: {} url verification answered", channel);
            (StatusCode::OK, t).into_response()
        }
        Inbound::Ignored(what) => {
            log::debug!("gateway: {} ignored {}", channel, what);
            ack(adapter)
        }
        Inbound::Message(msg) => {
            let key = msg.idempotency_key().to_string();
            match intake.try_submit(msg) {
                Ok(()) => {
                    log::debug!("gateway: {} queued {} (depth {})", channel, key, intake.depth());
                    ack(adapter)
                }
                Err((e, _)) => {
                    log::warn!("gateway: {} rejected {}: {}", channel, key, e);
                    let status = StatusCode::from_u16(adapter.backpressure_status())
                        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
                    status.into_response()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::TelegramChannel;
    use crate::config::TelegramChannelConfig;
    use crate::intake::intake_queue;

    fn telegram() -> TelegramChannel {
        let cfg = TelegramChannelConfig {
            enabled: true,
            webhook_secret: Some("s3cret".into()),
            ..Default::default()
        };
        TelegramChannel::from_config(&cfg, Some("123:abc".into())).unwrap()
    }

    fn update(id: i64, text: &str) -> RawRequest {
        let body = json!({
            "update_id": id,
            "message": {"message_id": 1, "chat": {"id": 42}, "from": {"id": 7}, "text": text}
        });
        RawRequest::post(serde_json::to_vec(&body).unwrap())
            .with_header("x-telegram-bot-api-secret-token", "s3cret")
    }

    #[tokio::test]
    async fn accepted_update_is_queued() {
        let tg = telegram();
        let (q, rx) = intake_queue(4);
        let res = handle_webhook(&tg, &q, update(10, "hi"));
        assert_eq!(res.status(), StatusCode::OK);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.idempotency_key(), "telegram:10");
        assert_eq!(msg.conversation_id(), "42");
    }

    #[tokio::test]
    async fn wrong_secret_is_forbidden_and_not_queued() {
        let tg = telegram();
        let (q, _rx) = intake_queue(4);
        let req = update(11, "hi").with_header("x-telegram-bot-api-secret-token", "nope");
        assert_eq!(handle_webhook(&tg, &q, req).status(), StatusCode::FORBIDDEN);
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn garbage_body_is_acknowledged() {
        let tg = telegram();
        let (q, _rx) = intake_queue(4);
        let req = RawRequest::post("not json").with_header("x-telegram-bot-api-secret-token", "s3cret");
        assert_eq!(handle_webhook(&tg, &q, req).status(), StatusCode::OK);
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn full_queue_signals_backpressure() {
        let tg = telegram();
        let (q, _rx) = intake_queue(1);
        assert_eq!(handle_webhook(&tg, &q, update(1, "a")).status(), StatusCode::OK);
        assert_eq!(
            handle_webhook(&tg, &q, update(2, "b")).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(q.depth(), 1);
    }

    /// Telegram adapter mounted on an arbitrary path.
    struct Remounted(TelegramChannel, &'static str);

    #[async_trait::async_trait]
    impl ChannelAdapter for Remounted {
        fn channel(&self) -> crate::message::Channel {
            self.0.channel()
        }
        fn endpoint_path(&self) -> &str {
            self.1
        }
        fn verify(&self, req: &RawRequest) -> crate::Result<()> {
            self.0.verify(req)
        }
        fn normalize(&self, req: &RawRequest) -> crate::Result<Inbound> {
            self.0.normalize(req)
        }
        async fn send(&self, conversation_id: &str, text: &str) -> crate::Result<()> {
            self.0.send(conversation_id, text).await
        }
    }

    #[tokio::test]
    async fn unusable_or_taken_paths_are_not_mounted() {
        let (q, _rx) = intake_queue(4);
        let adapters: Vec<Arc<dyn ChannelAdapter>> = vec![
            Arc::new(telegram()),
            Arc::new(telegram()),
            Arc::new(Remounted(telegram(), "/")),
            Arc::new(Remounted(telegram(), "no-slash")),
        ];
        let app = router(adapters, q);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let health: serde_json::Value = reqwest::get(format!("{}/", base)).await.unwrap().json().await.unwrap();
        assert_eq!(health["channels"], json!(["telegram"]));
    }
}
