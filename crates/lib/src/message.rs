//! Canonical inbound message shared by every channel.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Width of the time bucket used when a platform gives no message id.
const KEY_BUCKET_SECS: i64 = 60;

/// Supported chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Telegram,
    Feishu,
    #[serde(rename = "wecom")]
    WeCom,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Telegram, Channel::Feishu, Channel::WeCom];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Telegram => "telegram",
            Channel::Feishu => "feishu",
            Channel::WeCom => "wecom",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Ok(Channel::Telegram),
            "feishu" | "lark" => Ok(Channel::Feishu),
            "wecom" | "wework" => Ok(Channel::WeCom),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}

/// Where a message came from; decides how the dispatcher treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A user wrote it on a chat platform.
    Platform,
    /// A periodic job: the text is a prompt for the backend, the reply goes to the conversation.
    Scheduled,
    /// Delivered to the conversation as-is, no backend call (escalations, notices).
    Notice,
}

/// One normalized inbound message. Immutable once built.
#[derive(Debug, Clone)]
pub struct Message {
    channel: Channel,
    conversation_id: String,
    sender_id: String,
    text: String,
    received_at: DateTime<Utc>,
    idempotency_key: String,
    origin: Origin,
    raw: Option<Bytes>,
}

impl Message {
    /// Message received from a platform. `platform_id` is the platform's own message/event id;
    /// when absent a key is synthesized from conversation, text and a time bucket.
    pub fn inbound(
        channel: Channel,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        platform_id: Option<&str>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let text = text.into();
        let received_at = Utc::now();
        let idempotency_key = match platform_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => format!("{}:{}", channel, id),
            None => synthesize_idempotency_key(channel, &conversation_id, &text, received_at),
        };
        Self {
            channel,
            conversation_id,
            sender_id: sender_id.into(),
            text,
            received_at,
            idempotency_key,
            origin: Origin::Platform,
            raw: None,
        }
    }

    /// Message produced inside the gateway (scheduler, heartbeat). Always unique.
    pub fn synthetic(
        channel: Channel,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        origin: Origin,
    ) -> Self {
        Self {
            channel,
            conversation_id: conversation_id.into(),
            sender_id: "clawgate".to_string(),
            text: text.into(),
            received_at: Utc::now(),
            idempotency_key: format!("sched:{}", uuid::Uuid::new_v4()),
            origin,
            raw: None,
        }
    }

    /// Keep a reference to the raw platform payload for diagnostics.
    pub fn with_raw(mut self, raw: Bytes) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn raw(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }
}

/// Hash of channel, conversation, text and the minute bucket of `at`.
pub fn synthesize_idempotency_key(
    channel: Channel,
    conversation_id: &str,
    text: &str,
    at: DateTime<Utc>,
) -> String {
    let bucket = at.timestamp().div_euclid(KEY_BUCKET_SECS);
    let mut hasher = Sha256::new();
    hasher.update(channel.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(conversation_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hasher.update([0u8]);
    hasher.update(bucket.to_be_bytes());
    format!("{}:h:{}", channel, hex::encode(&hasher.finalize()[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn platform_id_wins_over_hash() {
        let m = Message::inbound(Channel::Telegram, "42", "7", "hi", Some("1001"));
        assert_eq!(m.idempotency_key(), "telegram:1001");
        assert_eq!(m.origin(), Origin::Platform);
    }

    #[test]
    fn synthesized_key_is_stable_within_bucket() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 5).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 55).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 1, 5).unwrap();
        let a = synthesize_idempotency_key(Channel::WeCom, "u1", "hello", t0);
        let b = synthesize_idempotency_key(Channel::WeCom, "u1", "hello", t1);
        let c = synthesize_idempotency_key(Channel::WeCom, "u1", "hello", t2);
        let d = synthesize_idempotency_key(Channel::WeCom, "u2", "hello", t0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn synthetic_messages_never_collide() {
        let a = Message::synthetic(Channel::Feishu, "oc_1", "ping", Origin::Notice);
        let b = Message::synthetic(Channel::Feishu, "oc_1", "ping", Origin::Notice);
        assert_ne!(a.idempotency_key(), b.idempotency_key());
    }

    #[test]
    fn channel_names_parse() {
        assert_eq!("WeCom".parse::<Channel>().unwrap(), Channel::WeCom);
        assert_eq!("lark".parse::<Channel>().unwrap(), Channel::Feishu);
        assert!("slack".parse::<Channel>().is_err());
        assert_eq!(serde_json::to_string(&Channel::WeCom).unwrap(), "\"wecom\"");
    }
}
