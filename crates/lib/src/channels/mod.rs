//! Communication channels (Telegram, Feishu, WeCom).
//!
//! Each platform implements [`ChannelAdapter`]: verify an inbound webhook request,
//! normalize it into a [`Message`], and send replies back. The webhook server and the
//! dispatcher only talk to adapters through this trait and the [`ChannelRegistry`].

mod feishu;
mod registry;
mod telegram;
mod wecom;

use crate::error::{GatewayError, Result};
use crate::message::{Channel, Message};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

pub use feishu::FeishuChannel;
pub use registry::ChannelRegistry;
pub use telegram::{TelegramChannel, TelegramUpdate};
pub use wecom::WeComChannel;

/// Inbound HTTP request as seen by an adapter. Header names are lowercase.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Bytes,
}

impl RawRequest {
    pub fn post(body: impl Into<Bytes>) -> Self {
        Self {
            method: "POST".to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

/// Result of normalizing one inbound request.
#[derive(Debug)]
pub enum Inbound {
    /// A user message for the dispatcher.
    Message(Message),
    /// Platform URL verification; answered directly, nothing is dispatched.
    Handshake(HandshakeReply),
    /// Valid event the gateway does not act on (joins, stickers, read receipts).
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeReply {
    Json(serde_json::Value),
    Text(String),
}

/// One chat platform: inbound verification and normalization, outbound send.
/// Adapters are stateless about retries; the dispatcher owns retry policy.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Webhook path this adapter is mounted on (e.g. "/telegram/webhook").
    fn endpoint_path(&self) -> &str;

    /// Check signature/secret/token. `GatewayError::Auth` on mismatch.
    fn verify(&self, req: &RawRequest) -> Result<()>;

    /// Map the platform payload to a message. `GatewayError::Parse` when unreadable.
    fn normalize(&self, req: &RawRequest) -> Result<Inbound>;

    /// Send one platform message. `text` fits in [`max_message_chars`](Self::max_message_chars);
    /// longer replies are split by the caller so each part can be retried on its own.
    async fn send(&self, conversation_id: &str, text: &str) -> Result<()>;

    /// Longest text the platform accepts in a single message, in characters.
    fn max_message_chars(&self) -> usize {
        4096
    }

    /// Stop any background connector (poll loop). Default: nothing to stop.
    fn stop(&self) {}

    /// Body of the immediate acknowledgement.
    fn ack_body(&self) -> &'static str {
        ""
    }

    /// HTTP status used to signal backpressure to the platform.
    fn backpressure_status(&self) -> u16 {
        503
    }
}

/// Check a configured webhook path: absolute, not the health route "/", and a plain
/// literal (no route captures, query or whitespace).
pub(crate) fn validate_endpoint_path(channel: Channel, path: &str) -> Result<String> {
    let path = path.trim();
    let invalid = |why: &str| GatewayError::Config(format!("{} endpointPath {:?} {}", channel, path, why));
    if !path.starts_with('/') {
        return Err(invalid("must start with /"));
    }
    if path == "/" {
        return Err(invalid("is reserved for the health endpoint"));
    }
    if path.contains("//") {
        return Err(invalid("has an empty segment"));
    }
    if path.chars().any(|c| c.is_whitespace() || matches!(c, ':' | '*' | '?' | '#' | '{' | '}')) {
        return Err(invalid("must be a literal path"));
    }
    Ok(path.to_string())
}

/// Split `text` into chunks of at most `max_chars` characters, preferring newline boundaries.
pub(crate) fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest: Vec<char> = text.chars().collect();
    while rest.len() > max_chars {
        let window = &rest[..max_chars];
        let cut = window
            .iter()
            .rposition(|c| *c == '\n')
            .filter(|i| *i > max_chars / 2)
            .map(|i| i + 1)
            .unwrap_or(max_chars);
        chunks.push(rest[..cut].iter().collect());
        rest.drain(..cut);
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.into_iter().collect());
    }
    chunks
}
