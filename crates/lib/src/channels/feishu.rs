//! Feishu (Lark) channel: event subscription webhook inbound, im/v1/messages outbound.

use super::{validate_endpoint_path, ChannelAdapter, HandshakeReply, Inbound, RawRequest};
use crate::config::FeishuChannelConfig;
use crate::error::{GatewayError, Result};
use crate::message::{Channel, Message};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::Aes256;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

const DEFAULT_DOMAIN: &str = "open.feishu.cn";
const SIGNATURE_HEADER: &str = "X-Lark-Signature";
const TIMESTAMP_HEADER: &str = "X-Lark-Request-Timestamp";
const NONCE_HEADER: &str = "X-Lark-Request-Nonce";
const MESSAGE_EVENT: &str = "im.message.receive_v1";
const MAX_MESSAGE_CHARS: usize = 4000;
/// Refresh the tenant token this long before it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);
/// Tenant token invalid or expired.
const TOKEN_INVALID_CODES: [i64; 2] = [99991663, 99991661];

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct FeishuChannel {
    app_id: String,
    app_secret: String,
    verification_token: Option<String>,
    encrypt_key: Option<String>,
    api_base: String,
    endpoint_path: String,
    token: Mutex<Option<CachedToken>>,
    client: reqwest::Client,
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl FeishuChannel {
    /// Build from config; `app_secret` is the resolved secret (env override applied).
    pub fn from_config(cfg: &FeishuChannelConfig, app_secret: Option<String>) -> Result<Self> {
        let app_id = non_empty(cfg.app_id.as_ref())
            .ok_or_else(|| GatewayError::Config("feishu appId missing".to_string()))?;
        let app_secret = app_secret
            .ok_or_else(|| GatewayError::Config("feishu appSecret missing".to_string()))?;
        let verification_token = non_empty(cfg.verification_token.as_ref());
        let encrypt_key = non_empty(cfg.encrypt_key.as_ref());
        if verification_token.is_none() && encrypt_key.is_none() {
            return Err(GatewayError::Config(
                "feishu needs verificationToken or encryptKey to authenticate events".to_string(),
            ));
        }
        let domain = non_empty(cfg.domain.as_ref()).unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
        let api_base = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", domain)
        };
        Ok(Self {
            app_id,
            app_secret,
            verification_token,
            encrypt_key,
            api_base,
            endpoint_path: validate_endpoint_path(Channel::Feishu, &cfg.endpoint_path)?,
            token: Mutex::new(None),
            client: reqwest::Client::new(),
        })
    }

    /// Parse the body, decrypting `{"encrypt": ...}` envelopes.
    fn decode_payload(&self, body: &[u8]) -> Result<Value> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Parse(format!("feishu body: {}", e)))?;
        let Some(encrypted) = payload.get("encrypt").and_then(Value::as_str) else {
            return Ok(payload);
        };
        let key = self
            .encrypt_key
            .as_deref()
            .ok_or_else(|| GatewayError::Parse("feishu encrypted event but no encryptKey configured".to_string()))?;
        decrypt_event(key, encrypted)
    }

    async fn tenant_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(ref t) = *cached {
            if t.expires_at > Instant::now() {
                return Ok(t.value.clone());
            }
        }
        let url = format!("{}/open-apis/auth/v3/tenant_access_token/internal", self.api_base);
        let res = self
            .client
            .post(url)
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await
            .map_err(|e| GatewayError::delivery_transport("feishu token", e))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::delivery_status("feishu token", status, &body));
        }
        let payload: Value = res
            .json()
            .await
            .map_err(|e| GatewayError::delivery_transport("feishu token", e))?;
        let code = payload.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let msg = payload.get("msg").and_then(Value::as_str).unwrap_or("unknown");
            return Err(GatewayError::delivery(format!("feishu token failed: {} {}", code, msg), false));
        }
        let value = payload
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::delivery("feishu token missing tenant_access_token", false))?
            .to_string();
        let ttl = payload.get("expire").and_then(Value::as_u64).unwrap_or(7200);
        let ttl = Duration::from_secs(ttl).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(value)
    }

    async fn post_message(&self, chat_id: &str, text: &str) -> Result<()> {
        let token = self.tenant_token().await?;
        let url = format!("{}/open-apis/im/v1/messages?receive_id_type=chat_id", self.api_base);
        let res = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&json!({
                "receive_id": chat_id,
                "msg_type": "text",
                "content": json!({ "text": text }).to_string(),
            }))
            .send()
            .await
            .map_err(|e| GatewayError::delivery_transport("feishu send", e))?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        let code = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("code").and_then(Value::as_i64));
        if let Some(c) = code.filter(|c| TOKEN_INVALID_CODES.contains(c)) {
            *self.token.lock().await = None;
            return Err(GatewayError::delivery(format!("feishu token rejected ({})", c), true));
        }
        if !status.is_success() {
            return Err(GatewayError::delivery_status("feishu send", status, &body));
        }
        match code {
            Some(0) | None => Ok(()),
            Some(c) => Err(GatewayError::delivery(format!("feishu send failed: code {} {}", c, body), false)),
        }
    }
}

/// hex(sha256(timestamp + nonce + encrypt_key + body)), compared case-insensitively.
pub(crate) fn verify_sign(encrypt_key: &str, timestamp: &str, nonce: &str, body: &[u8], sign: &str) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(encrypt_key.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize()).eq_ignore_ascii_case(sign.trim())
}

/// AES-256-CBC with key sha256(encrypt_key); the first 16 bytes of the decoded payload are the IV.
pub(crate) fn decrypt_event(encrypt_key: &str, encrypted: &str) -> Result<Value> {
    let buffer = base64::engine::general_purpose::STANDARD
        .decode(encrypted.trim())
        .map_err(|_| GatewayError::Parse("feishu encrypt is not base64".to_string()))?;
    if buffer.len() < 32 || buffer.len() % 16 != 0 {
        return Err(GatewayError::Parse("feishu encrypted body has invalid length".to_string()));
    }
    let key = Sha256::digest(encrypt_key.as_bytes());
    let (iv, cipher_text) = buffer.split_at(16);
    let mut cipher_text = cipher_text.to_vec();
    let plain = Aes256CbcDec::new(key.as_slice().into(), iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut cipher_text)
        .map_err(|_| GatewayError::Parse("failed to decrypt feishu event".to_string()))?;
    serde_json::from_slice(plain)
        .map_err(|e| GatewayError::Parse(format!("feishu decrypted event: {}", e)))
}

fn payload_token(payload: &Value) -> Option<&str> {
    payload
        .pointer("/header/token")
        .or_else(|| payload.get("token"))
        .and_then(Value::as_str)
        .map(str::trim)
}

/// Drop `@_user_N` mention placeholders Feishu inserts for @-mentions. Line breaks and
/// the spacing between the remaining words are kept.
fn strip_mentions(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            line.split(' ')
                .filter(|w| !w.starts_with("@_user_"))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn event_to_inbound(payload: &Value) -> Result<Inbound> {
    let event_type = payload
        .pointer("/header/event_type")
        .and_then(Value::as_str)
        .unwrap_or("");
    if event_type != MESSAGE_EVENT {
        return Ok(Inbound::Ignored(format!("feishu event {}", event_type)));
    }
    let message = payload
        .pointer("/event/message")
        .ok_or_else(|| GatewayError::Parse("feishu event missing message".to_string()))?;
    let chat_id = message
        .get("chat_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Parse("feishu message missing chat_id".to_string()))?;
    let message_type = message.get("message_type").and_then(Value::as_str).unwrap_or("text");
    if message_type != "text" {
        return Ok(Inbound::Ignored(format!("feishu {} message", message_type)));
    }
    let content: Value = message
        .get("content")
        .and_then(Value::as_str)
        .and_then(|c| serde_json::from_str(c).ok())
        .unwrap_or(Value::Null);
    let text = content
        .get("text")
        .and_then(Value::as_str)
        .map(strip_mentions)
        .unwrap_or_default();
    if text.is_empty() {
        return Ok(Inbound::Ignored("feishu message without text".to_string()));
    }
    let sender = payload
        .pointer("/event/sender/sender_id")
        .and_then(|s| s.get("open_id").or_else(|| s.get("user_id")))
        .and_then(Value::as_str)
        .unwrap_or("");
    let id = message
        .get("message_id")
        .and_then(Value::as_str)
        .or_else(|| payload.pointer("/header/event_id").and_then(Value::as_str));
    Ok(Inbound::Message(Message::inbound(Channel::Feishu, chat_id, sender, text, id)))
}

#[async_trait]
impl ChannelAdapter for FeishuChannel {
    fn channel(&self) -> Channel {
        Channel::Feishu
    }

    fn endpoint_path(&self) -> &str {
        &self.endpoint_path
    }

    fn verify(&self, req: &RawRequest) -> Result<()> {
        if let (Some(key), Some(sign)) = (self.encrypt_key.as_deref(), req.header(SIGNATURE_HEADER)) {
            let timestamp = req.header(TIMESTAMP_HEADER).unwrap_or("");
            let nonce = req.header(NONCE_HEADER).unwrap_or("");
            if verify_sign(key, timestamp, nonce, &req.body, sign) {
                return Ok(());
            }
            return Err(GatewayError::Auth("feishu signature mismatch".to_string()));
        }
        let payload = self.decode_payload(&req.body)?;
        match self.verification_token.as_deref() {
            Some(expected) => match payload_token(&payload) {
                Some(t) if t == expected => Ok(()),
                _ => Err(GatewayError::Auth("feishu verification token mismatch".to_string())),
            },
            // Only the encrypt key is configured: a payload that decrypted with it is authentic.
            None if serde_json::from_slice::<Value>(&req.body)
                .map(|v| v.get("encrypt").is_some())
                .unwrap_or(false) =>
            {
                Ok(())
            }
            None => Err(GatewayError::Auth("feishu event is neither signed nor encrypted".to_string())),
        }
    }

    fn normalize(&self, req: &RawRequest) -> Result<Inbound> {
        let payload = self.decode_payload(&req.body)?;
        if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
            let challenge = payload
                .get("challenge")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::Parse("feishu url_verification without challenge".to_string()))?;
            return Ok(Inbound::Handshake(HandshakeReply::Json(json!({ "challenge": challenge }))));
        }
        Ok(match event_to_inbound(&payload)? {
            Inbound::Message(m) => Inbound::Message(m.with_raw(req.body.clone())),
            other => other,
        })
    }

    async fn send(&self, conversation_id: &str, text: &str) -> Result<()> {
        self.post_message(conversation_id, text).await
    }

    fn max_message_chars(&self) -> usize {
        MAX_MESSAGE_CHARS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes256CbcEnc = cbc::Encryptor<Aes256>;

    fn channel(token: Option<&str>, key: Option<&str>) -> FeishuChannel {
        let cfg = FeishuChannelConfig {
            enabled: true,
            app_id: Some("cli_test".to_string()),
            verification_token: token.map(String::from),
            encrypt_key: key.map(String::from),
            ..Default::default()
        };
        FeishuChannel::from_config(&cfg, Some("secret".to_string())).unwrap()
    }

    fn encrypt(key: &str, plain: &str) -> String {
        let key = Sha256::digest(key.as_bytes());
        let iv = [7u8; 16];
        let mut buf = plain.as_bytes().to_vec();
        let len = buf.len();
        buf.resize(len + 16, 0);
        let ct = Aes256CbcEnc::new(key.as_slice().into(), iv.as_slice().into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, len)
            .unwrap()
            .to_vec();
        let mut out = iv.to_vec();
        out.extend_from_slice(&ct);
        base64::engine::general_purpose::STANDARD.encode(out)
    }

    fn text_event(message_id: &str, text: &str) -> Value {
        json!({
            "schema": "2.0",
            "header": { "event_id": "ev1", "event_type": "im.message.receive_v1", "token": "vt" },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_1" } },
                "message": {
                    "message_id": message_id,
                    "chat_id": "oc_9",
                    "message_type": "text",
                    "content": json!({ "text": text }).to_string()
                }
            }
        })
    }

    #[test]
    fn mentions_are_removed_but_layout_is_kept() {
        assert_eq!(strip_mentions("@_user_1 what's up"), "what's up");
        assert_eq!(
            strip_mentions("@_user_1 steps:\n1. build\n2.  test @_user_2\n\nthanks"),
            "steps:\n1. build\n2.  test\n\nthanks"
        );
        assert_eq!(strip_mentions("  indented\n    code"), "indented\n    code");
    }

    #[test]
    fn requires_some_event_authentication() {
        let cfg = FeishuChannelConfig {
            app_id: Some("cli".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            FeishuChannel::from_config(&cfg, Some("s".to_string())),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn verification_token_is_checked() {
        let ch = channel(Some("vt"), None);
        let body = text_event("om_1", "hi").to_string();
        assert!(ch.verify(&RawRequest::post(body)).is_ok());
        let mut wrong = text_event("om_1", "hi");
        wrong["header"]["token"] = json!("other");
        assert!(matches!(
            ch.verify(&RawRequest::post(wrong.to_string())),
            Err(GatewayError::Auth(_))
        ));
    }

    #[test]
    fn signature_is_checked() {
        let ch = channel(None, Some("ek"));
        let body = r#"{"encrypt":"abc"}"#;
        let mut hasher = Sha256::new();
        hasher.update(b"1700000000nonce1ek");
        hasher.update(body.as_bytes());
        let sign = hex::encode(hasher.finalize());
        let req = RawRequest::post(body)
            .with_header(TIMESTAMP_HEADER, "1700000000")
            .with_header(NONCE_HEADER, "nonce1")
            .with_header(SIGNATURE_HEADER, &sign);
        assert!(ch.verify(&req).is_ok());
        let forged = req.clone().with_header(NONCE_HEADER, "nonce2");
        assert!(matches!(ch.verify(&forged), Err(GatewayError::Auth(_))));
    }

    #[test]
    fn url_verification_echoes_challenge() {
        let ch = channel(Some("vt"), None);
        let body = json!({ "type": "url_verification", "challenge": "c-123", "token": "vt" }).to_string();
        let req = RawRequest::post(body);
        assert!(ch.verify(&req).is_ok());
        match ch.normalize(&req).unwrap() {
            Inbound::Handshake(HandshakeReply::Json(v)) => assert_eq!(v, json!({ "challenge": "c-123" })),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn encrypted_text_event_normalizes() {
        let ch = channel(None, Some("ek"));
        let inner = text_event("om_42", "@_user_1 what's up").to_string();
        let body = json!({ "encrypt": encrypt("ek", &inner) }).to_string();
        let req = RawRequest::post(body);
        assert!(ch.verify(&req).is_ok());
        match ch.normalize(&req).unwrap() {
            Inbound::Message(m) => {
                assert_eq!(m.idempotency_key(), "feishu:om_42");
                assert_eq!(m.conversation_id(), "oc_9");
                assert_eq!(m.sender_id(), "ou_1");
                assert_eq!(m.text(), "what's up");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn other_events_are_ignored() {
        let ch = channel(Some("vt"), None);
        let body = json!({ "header": { "event_type": "im.chat.member.bot.added_v1", "token": "vt" } }).to_string();
        assert!(matches!(ch.normalize(&RawRequest::post(body)).unwrap(), Inbound::Ignored(_)));
        assert!(matches!(
            ch.normalize(&RawRequest::post("{oops")),
            Err(GatewayError::Parse(_))
        ));
    }
}
