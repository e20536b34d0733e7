//! WeCom (WeChat Work) self-built app: encrypted XML callback inbound, message/send outbound.

use super::{validate_endpoint_path, ChannelAdapter, HandshakeReply, Inbound, RawRequest};
use crate::config::WeComChannelConfig;
use crate::error::{GatewayError, Result};
use crate::message::{Channel, Message};
use aes::Aes256;
use async_trait::async_trait;
use base64::Engine;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_API_BASE: &str = "https://qyapi.weixin.qq.com";
/// message/send caps text content at 2048 bytes; 680 CJK characters stay under it.
const MAX_MESSAGE_CHARS: usize = 680;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);
/// access_token expired / invalid.
const TOKEN_INVALID_CODES: [i64; 3] = [40014, 42001, 41001];

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct WeComChannel {
    corp_id: String,
    agent_id: i64,
    secret: String,
    token: String,
    aes_key: [u8; 32],
    api_base: String,
    endpoint_path: String,
    access_token: Mutex<Option<CachedToken>>,
    client: reqwest::Client,
}

fn required(v: Option<&String>, what: &str) -> Result<String> {
    v.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Config(format!("wecom {} missing", what)))
}

/// EncodingAESKey is 43 base64 characters without the trailing '='.
pub(crate) fn decode_aes_key(encoding_aes_key: &str) -> Result<[u8; 32]> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(format!("{}=", encoding_aes_key.trim()))
        .map_err(|_| GatewayError::Config("wecom encodingAesKey is not base64".to_string()))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| GatewayError::Config("wecom encodingAesKey must decode to 32 bytes".to_string()))
}

/// hex(sha1(sorted(token, timestamp, nonce, encrypt))).
pub(crate) fn verify_signature(token: &str, timestamp: &str, nonce: &str, encrypt: &str, signature: &str) -> bool {
    let mut parts = [token.trim(), timestamp.trim(), nonce.trim(), encrypt.trim()];
    if parts.iter().any(|p| p.is_empty()) || signature.trim().is_empty() {
        return false;
    }
    parts.sort_unstable();
    let mut sha = Sha1::new();
    for p in parts {
        sha.update(p.as_bytes());
    }
    hex::encode(sha.finalize()).eq_ignore_ascii_case(signature.trim())
}

/// Padding is PKCS#7 over 32-byte blocks, so it is stripped by hand.
fn strip_padding(input: &[u8]) -> Result<&[u8]> {
    let pad = *input
        .last()
        .ok_or_else(|| GatewayError::Parse("wecom payload is empty".to_string()))? as usize;
    if pad == 0 || pad > 32 || pad > input.len() {
        return Err(GatewayError::Parse("wecom payload padding is invalid".to_string()));
    }
    Ok(&input[..input.len() - pad])
}

/// Decrypt a callback ciphertext: random(16) | len(4, BE) | msg | receive_id.
pub(crate) fn decrypt_message(key: &[u8; 32], encrypt: &str, receive_id: &str) -> Result<String> {
    let mut buf = base64::engine::general_purpose::STANDARD
        .decode(encrypt.trim())
        .map_err(|_| GatewayError::Parse("wecom ciphertext is not base64".to_string()))?;
    let iv = &key[..16];
    let plain = cbc::Decryptor::<Aes256>::new(key.as_slice().into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| GatewayError::Parse("failed to decrypt wecom ciphertext".to_string()))?;
    let plain = strip_padding(plain)?;
    if plain.len() < 20 {
        return Err(GatewayError::Parse("wecom payload is too short".to_string()));
    }
    let len = u32::from_be_bytes([plain[16], plain[17], plain[18], plain[19]]) as usize;
    let end = 20usize.saturating_add(len);
    if end > plain.len() {
        return Err(GatewayError::Parse("wecom payload length is out of range".to_string()));
    }
    if &plain[end..] != receive_id.as_bytes() {
        return Err(GatewayError::Auth("wecom receive_id mismatch".to_string()));
    }
    String::from_utf8(plain[20..end].to_vec())
        .map_err(|_| GatewayError::Parse("wecom payload is not utf-8".to_string()))
}

/// Flatten `<xml><Tag>value</Tag>...</xml>` into tag -> text (CDATA included).
pub(crate) fn parse_xml_fields(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut current: Option<String> = None;
    let mut out = HashMap::new();
    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(e)) => {
                current = Some(String::from_utf8_lossy(e.local_name().as_ref()).to_string());
            }
            Ok(Event::Text(e)) => {
                if let Some(tag) = current.take() {
                    let text = e
                        .unescape()
                        .map_err(|_| GatewayError::Parse("wecom xml text decode failed".to_string()))?;
                    out.insert(tag, text.trim().to_string());
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(tag) = current.take() {
                    out.insert(tag, String::from_utf8_lossy(&e.into_inner()).trim().to_string());
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(err) => return Err(GatewayError::Parse(format!("wecom xml: {}", err))),
            _ => {}
        }
        buffer.clear();
    }
    Ok(out)
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    fields.get(name).map(String::as_str).filter(|s| !s.is_empty())
}

impl WeComChannel {
    /// Build from config; `secret` is the resolved app secret (env override applied).
    pub fn from_config(cfg: &WeComChannelConfig, secret: Option<String>) -> Result<Self> {
        let corp_id = required(cfg.corp_id.as_ref(), "corpId")?;
        let agent_id = cfg
            .agent_id
            .ok_or_else(|| GatewayError::Config("wecom agentId missing".to_string()))?;
        let secret = secret.ok_or_else(|| GatewayError::Config("wecom secret missing".to_string()))?;
        let token = required(cfg.token.as_ref(), "token")?;
        let aes_key = decode_aes_key(&required(cfg.encoding_aes_key.as_ref(), "encodingAesKey")?)?;
        Ok(Self {
            corp_id,
            agent_id,
            secret,
            token,
            aes_key,
            api_base: cfg
                .api_base
                .as_deref()
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            endpoint_path: validate_endpoint_path(Channel::WeCom, &cfg.endpoint_path)?,
            access_token: Mutex::new(None),
            client: reqwest::Client::new(),
        })
    }

    /// The ciphertext the signature covers: `echostr` on GET, `<Encrypt>` on POST.
    fn ciphertext(&self, req: &RawRequest) -> Result<String> {
        if req.is_get() {
            return req
                .query_param("echostr")
                .map(String::from)
                .ok_or_else(|| GatewayError::Parse("wecom url verification without echostr".to_string()));
        }
        let xml = std::str::from_utf8(&req.body)
            .map_err(|_| GatewayError::Parse("wecom body is not utf-8".to_string()))?;
        let fields = parse_xml_fields(xml)?;
        field(&fields, "Encrypt")
            .map(String::from)
            .ok_or_else(|| GatewayError::Parse("wecom body missing Encrypt".to_string()))
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.access_token.lock().await;
        if let Some(ref t) = *cached {
            if t.expires_at > Instant::now() {
                return Ok(t.value.clone());
            }
        }
        let url = format!("{}/cgi-bin/gettoken", self.api_base);
        let res = self
            .client
            .get(url)
            .query(&[("corpid", self.corp_id.as_str()), ("corpsecret", self.secret.as_str())])
            .send()
            .await
            .map_err(|e| GatewayError::delivery_transport("wecom gettoken", e))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::delivery_status("wecom gettoken", status, &body));
        }
        let payload: Value = res
            .json()
            .await
            .map_err(|e| GatewayError::delivery_transport("wecom gettoken", e))?;
        let errcode = payload.get("errcode").and_then(Value::as_i64).unwrap_or(0);
        if errcode != 0 {
            let errmsg = payload.get("errmsg").and_then(Value::as_str).unwrap_or("unknown");
            return Err(GatewayError::delivery(
                format!("wecom gettoken failed: {} {}", errcode, errmsg),
                false,
            ));
        }
        let value = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::delivery("wecom gettoken missing access_token", false))?
            .to_string();
        let ttl = payload.get("expires_in").and_then(Value::as_u64).unwrap_or(7200);
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl).saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(value)
    }

    async fn post_message(&self, user_id: &str, text: &str) -> Result<()> {
        let token = self.access_token().await?;
        let url = format!("{}/cgi-bin/message/send", self.api_base);
        let res = self
            .client
            .post(url)
            .query(&[("access_token", token.as_str())])
            .json(&json!({
                "touser": user_id,
                "msgtype": "text",
                "agentid": self.agent_id,
                "text": { "content": text },
            }))
            .send()
            .await
            .map_err(|e| GatewayError::delivery_transport("wecom send", e))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::delivery_status("wecom send", status, &body));
        }
        let payload: Value = res
            .json()
            .await
            .map_err(|e| GatewayError::delivery_transport("wecom send", e))?;
        match payload.get("errcode").and_then(Value::as_i64).unwrap_or(0) {
            0 => Ok(()),
            code if TOKEN_INVALID_CODES.contains(&code) => {
                *self.access_token.lock().await = None;
                Err(GatewayError::delivery(format!("wecom access token rejected ({})", code), true))
            }
            code => {
                let errmsg = payload.get("errmsg").and_then(Value::as_str).unwrap_or("unknown");
                Err(GatewayError::delivery(format!("wecom send failed: {} {}", code, errmsg), false))
            }
        }
    }
}

#[async_trait]
impl ChannelAdapter for WeComChannel {
    fn channel(&self) -> Channel {
        Channel::WeCom
    }

    fn endpoint_path(&self) -> &str {
        &self.endpoint_path
    }

    fn verify(&self, req: &RawRequest) -> Result<()> {
        let encrypt = self.ciphertext(req)?;
        let signature = req.query_param("msg_signature").unwrap_or("");
        let timestamp = req.query_param("timestamp").unwrap_or("");
        let nonce = req.query_param("nonce").unwrap_or("");
        if verify_signature(&self.token, timestamp, nonce, &encrypt, signature) {
            Ok(())
        } else {
            Err(GatewayError::Auth("wecom msg_signature mismatch".to_string()))
        }
    }

    fn normalize(&self, req: &RawRequest) -> Result<Inbound> {
        let encrypt = self.ciphertext(req)?;
        let plain = decrypt_message(&self.aes_key, &encrypt, &self.corp_id)?;
        if req.is_get() {
            return Ok(Inbound::Handshake(HandshakeReply::Text(plain)));
        }
        let fields = parse_xml_fields(&plain)?;
        let msg_type = field(&fields, "MsgType").unwrap_or("");
        if msg_type != "text" {
            return Ok(Inbound::Ignored(format!("wecom {} message", msg_type)));
        }
        let from = field(&fields, "FromUserName")
            .ok_or_else(|| GatewayError::Parse("wecom message missing FromUserName".to_string()))?;
        let Some(content) = field(&fields, "Content") else {
            return Ok(Inbound::Ignored("wecom message without content".to_string()));
        };
        let msg_id = field(&fields, "MsgId").or_else(|| field(&fields, "MsgID"));
        Ok(Inbound::Message(
            Message::inbound(Channel::WeCom, from, from, content, msg_id).with_raw(req.body.clone()),
        ))
    }

    async fn send(&self, conversation_id: &str, text: &str) -> Result<()> {
        self.post_message(conversation_id, text).await
    }

    fn max_message_chars(&self) -> usize {
        MAX_MESSAGE_CHARS
    }

    fn ack_body(&self) -> &'static str {
        "success"
    }
}
