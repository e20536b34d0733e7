//! Telegram channel: webhook or long-poll getUpdates inbound, sendMessage outbound via Bot API.

use super::{validate_endpoint_path, ChannelAdapter, Inbound, RawRequest};
use crate::config::TelegramChannelConfig;
use crate::error::{GatewayError, Result};
use crate::intake::IntakeQueue;
use crate::message::{Channel, Message};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";
/// sendMessage text limit.
const MAX_MESSAGE_CHARS: usize = 4096;
/// Poller wait before retrying an update the full intake queue refused.
const QUEUE_FULL_RETRY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    #[serde(default)]
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

/// Telegram adapter: verifies the webhook secret header, normalizes updates and sends replies.
pub struct TelegramChannel {
    token: String,
    api_base: String,
    webhook_secret: Option<String>,
    endpoint_path: String,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// Build from config; `token` is the resolved bot token (env override applied).
    pub fn from_config(cfg: &TelegramChannelConfig, token: Option<String>) -> Result<Self> {
        let token = token
            .ok_or_else(|| GatewayError::Config("telegram bot token not configured".to_string()))?;
        Ok(Self {
            token,
            api_base: cfg
                .api_base
                .clone()
                .unwrap_or_else(telegram_api_base)
                .trim_end_matches('/')
                .to_string(),
            webhook_secret: cfg
                .webhook_secret
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            endpoint_path: validate_endpoint_path(Channel::Telegram, &cfg.endpoint_path)?,
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        })
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Start the getUpdates long-poll loop feeding the intake queue. Returns a handle to await on shutdown.
    pub fn start_polling(
        self: Arc<Self>,
        intake: IntakeQueue,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, intake, cancel).await;
        })
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> std::result::Result<(Vec<TelegramUpdate>, Option<i64>), String> {
        let mut url = format!(
            "{}?timeout={}",
            self.method_url("getUpdates"),
            LONG_POLL_TIMEOUT
        );
        if let Some(off) = offset {
            url = format!("{}&offset={}", url, off);
        }
        let res = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(LONG_POLL_TIMEOUT + 10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getUpdates failed: {} {}", status, body));
        }
        let data: GetUpdatesResponse = res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err("getUpdates returned ok: false".to_string());
        }
        let next_offset = data
            .result
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1);
        Ok((data.result, next_offset))
    }

    /// Set webhook URL (and optional secret). When set, Telegram POSTs updates to the URL instead of getUpdates.
    pub async fn set_webhook(&self, url: &str) -> Result<()> {
        let mut body = serde_json::json!({ "url": url });
        if let Some(ref s) = self.webhook_secret {
            body["secret_token"] = serde_json::Value::String(s.clone());
        }
        self.call("setWebhook", &body).await
    }

    /// Remove webhook so the bot can use getUpdates again.
    pub async fn delete_webhook(&self) -> Result<()> {
        self.call("deleteWebhook", &serde_json::json!({})).await
    }

    async fn call(&self, method: &str, body: &serde_json::Value) -> Result<()> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::delivery_transport(method, e))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::delivery_status(method, status, &body));
        }
        Ok(())
    }

    fn parse_update(&self, body: &[u8]) -> Result<TelegramUpdate> {
        serde_json::from_slice(body)
            .map_err(|e| GatewayError::Parse(format!("telegram update: {}", e)))
    }
}

/// Map an update to the intake result. Updates without text are ignored.
fn update_to_inbound(update: &TelegramUpdate) -> Inbound {
    let Some(ref msg) = update.message else {
        return Inbound::Ignored(format!("update {} has no message", update.update_id));
    };
    let Some(text) = msg.text.as_deref().filter(|t| !t.trim().is_empty()) else {
        return Inbound::Ignored(format!("message {} has no text", msg.message_id));
    };
    let sender = msg
        .from
        .as_ref()
        .map(|u| u.id.to_string())
        .unwrap_or_default();
    Inbound::Message(Message::inbound(
        Channel::Telegram,
        msg.chat.id.to_string(),
        sender,
        text,
        Some(&update.update_id.to_string()),
    ))
}

async fn run_get_updates_loop(
    channel: Arc<TelegramChannel>,
    intake: IntakeQueue,
    cancel: CancellationToken,
) {
    let mut offset: Option<i64> = None;
    while channel.running() && !cancel.is_cancelled() {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            r = channel.get_updates(offset) => r,
        };
        match polled {
            Ok((updates, next)) => {
                offset = next.or(offset);
                for u in updates {
                    let Inbound::Message(mut msg) = update_to_inbound(&u) else {
                        continue;
                    };
                    loop {
                        match intake.try_submit(msg) {
                            Ok(()) => break,
                            Err((GatewayError::QueueFull { .. }, back)) => {
                                log::warn!("telegram: intake queue full, holding update {}", u.update_id);
                                msg = back;
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    _ = tokio::time::sleep(QUEUE_FULL_RETRY) => {}
                                }
                            }
                            Err((e, _)) => {
                                log::debug!("telegram: intake closed ({}), stopping loop", e);
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                }
            }
        }
    }
    log::info!("telegram: getUpdates loop stopped");
}

#[async_trait]
impl ChannelAdapter for TelegramChannel {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    fn endpoint_path(&self) -> &str {
        &self.endpoint_path
    }

    fn verify(&self, req: &RawRequest) -> Result<()> {
        let Some(ref expected) = self.webhook_secret else {
            return Ok(());
        };
        match req.header(SECRET_HEADER) {
            Some(provided) if provided == expected.as_str() => Ok(()),
            Some(_) => Err(GatewayError::Auth("telegram secret token mismatch".to_string())),
            None => Err(GatewayError::Auth("telegram secret token missing".to_string())),
        }
    }

    fn normalize(&self, req: &RawRequest) -> Result<Inbound> {
        let update = self.parse_update(&req.body)?;
        Ok(match update_to_inbound(&update) {
            Inbound::Message(m) => Inbound::Message(m.with_raw(req.body.clone())),
            other => other,
        })
    }

    async fn send(&self, conversation_id: &str, text: &str) -> Result<()> {
        let body = serde_json::json!({ "chat_id": conversation_id, "text": text });
        self.call("sendMessage", &body).await
    }

    fn max_message_chars(&self) -> usize {
        MAX_MESSAGE_CHARS
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Telegram retries webhook deliveries that fail; 429 tells it to back off.
    fn backpressure_status(&self) -> u16 {
        429
    }
}

/// Resolve Telegram bot API base URL (for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE").unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}
