//! Configuration types and loading.
//!
//! Config is loaded once at startup from a JSON file (e.g. `~/.clawgate/config.json`)
//! plus a few environment overrides for secrets, then shared read-only.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::message::Channel;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Webhook server, intake queue and dedup settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Per-platform channel settings.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Reasoning backend settings (endpoint, model, workspace).
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Backend call timeout, retry and delivery policy.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Session idle eviction.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Liveness self-check and escalation.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Periodic prompt jobs.
    #[serde(default)]
    pub cron: Vec<CronJobConfig>,

    /// Skill registry location.
    #[serde(default)]
    pub skills: SkillsConfig,
}

/// Webhook listener, intake queue and dedup window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the webhook HTTP server (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1"; expose publicly through a tunnel).
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Capacity of the bounded intake queue. Inbound work beyond it is rejected.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Number of dispatcher workers draining the intake queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long an idempotency key is remembered for duplicate detection.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    /// Upper bound on remembered idempotency keys.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_queue_depth() -> usize {
    256
}

fn default_workers() -> usize {
    4
}

fn default_dedup_window_secs() -> u64 {
    15 * 60
}

fn default_dedup_capacity() -> usize {
    10_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            queue_depth: default_queue_depth(),
            workers: default_workers(),
            dedup_window_secs: default_dedup_window_secs(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
    #[serde(default)]
    pub feishu: FeishuChannelConfig,
    #[serde(default)]
    pub wecom: WeComChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// When set, use webhook mode: Telegram POSTs updates to this URL. If unset, long-poll getUpdates is used.
    pub webhook_url: Option<String>,
    /// Secret checked against X-Telegram-Bot-Api-Secret-Token on webhook requests.
    pub webhook_secret: Option<String>,
    /// Local path the webhook server listens on for this channel.
    #[serde(default = "default_telegram_path")]
    pub endpoint_path: String,
    /// Bot API base URL override (tests, self-hosted Bot API servers).
    pub api_base: Option<String>,
}

fn default_telegram_path() -> String {
    "/telegram/webhook".to_string()
}

impl Default for TelegramChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            webhook_url: None,
            webhook_secret: None,
            endpoint_path: default_telegram_path(),
            api_base: None,
        }
    }
}

/// Feishu (Lark) channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeishuChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    pub app_id: Option<String>,
    /// Overridden by FEISHU_APP_SECRET env when set.
    pub app_secret: Option<String>,
    /// Verification token from the event subscription page; checked when no signature is present.
    pub verification_token: Option<String>,
    /// Encrypt key: enables payload decryption and X-Lark-Signature verification.
    pub encrypt_key: Option<String>,
    /// Open platform domain (default open.feishu.cn; open.larksuite.com for Lark).
    pub domain: Option<String>,
    #[serde(default = "default_feishu_path")]
    pub endpoint_path: String,
}

fn default_feishu_path() -> String {
    "/feishu/webhook".to_string()
}

impl Default for FeishuChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_id: None,
            app_secret: None,
            verification_token: None,
            encrypt_key: None,
            domain: None,
            endpoint_path: default_feishu_path(),
        }
    }
}

/// WeCom (WeChat Work) self-built application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeComChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    pub corp_id: Option<String>,
    pub agent_id: Option<i64>,
    /// Application secret. Overridden by WECOM_SECRET env when set.
    pub secret: Option<String>,
    /// Callback token used for msg_signature.
    pub token: Option<String>,
    /// 43-character EncodingAESKey from the callback settings.
    pub encoding_aes_key: Option<String>,
    /// API base override (default https://qyapi.weixin.qq.com).
    pub api_base: Option<String>,
    #[serde(default = "default_wecom_path")]
    pub endpoint_path: String,
}

fn default_wecom_path() -> String {
    "/wecom/webhook".to_string()
}

impl Default for WeComChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            corp_id: None,
            agent_id: None,
            secret: None,
            token: None,
            encoding_aes_key: None,
            api_base: None,
            endpoint_path: default_wecom_path(),
        }
    }
}

/// Reasoning backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    /// Ollama model name, exactly as listed by `ollama list`.
    pub default_model: Option<String>,
    /// Backend base URL (default http://127.0.0.1:11434). Overridden by CLAWGATE_BACKEND_URL.
    pub base_url: Option<String>,
    /// Workspace root holding AGENTS.md, SOUL.md and memory/ (default ~/.clawgate/workspace).
    pub workspace: Option<PathBuf>,
    /// HTTP client timeout for backend requests; the dispatcher applies its own per-call bound on top.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            base_url: None,
            workspace: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Backend call and reply delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Bound on a single backend call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Total backend attempts per message (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay; doubles per retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Total attempts for sending a reply through a channel.
    #[serde(default = "default_delivery_attempts")]
    pub delivery_attempts: u32,
    /// Reply sent to the user when the backend keeps failing.
    #[serde(default = "default_fallback_text")]
    pub fallback_text: String,
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_delivery_attempts() -> u32 {
    3
}

fn default_fallback_text() -> String {
    "Sorry, I could not process your message right now. Please try again in a moment.".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            delivery_attempts: default_delivery_attempts(),
            fallback_text: default_fallback_text(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsConfig {
    /// Sessions idle longer than this are dropped from the store.
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// How often the scheduler runs eviction.
    #[serde(default = "default_evict_interval_secs")]
    pub evict_interval_secs: u64,
}

fn default_idle_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_evict_interval_secs() -> u64 {
    5 * 60
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            evict_interval_secs: default_evict_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    /// Bound on a single self-check.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,
    /// Consecutive failures before one escalation is sent.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Channel and conversation that receive escalations.
    pub admin_channel: Option<Channel>,
    pub admin_conversation_id: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_secs() -> u64 {
    30 * 60
}

fn default_heartbeat_timeout_secs() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: default_heartbeat_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            admin_channel: None,
            admin_conversation_id: None,
        }
    }
}

/// A periodic prompt: at each tick `prompt` is sent to the backend and the reply delivered to the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobConfig {
    pub id: String,
    /// Cron expression, 5 fields (min hour dom month dow) or the 7-field form. Takes precedence over everySecs.
    pub cron: Option<String>,
    pub every_secs: Option<u64>,
    pub prompt: String,
    pub channel: Channel,
    pub conversation_id: String,
    #[serde(default = "default_job_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_job_timeout_secs() -> u64 {
    60
}

/// Skills load config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Skill root override. Defaults to `<workspace>/skills`.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl DispatchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

/// Non-empty trimmed value of env `var`, else the trimmed config value.
fn resolve_secret(var: &str, configured: Option<&String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    resolve_secret(
        "TELEGRAM_BOT_TOKEN",
        config.channels.telegram.bot_token.as_ref(),
    )
}

/// Resolve the Feishu app secret: env FEISHU_APP_SECRET overrides config.
pub fn resolve_feishu_secret(config: &Config) -> Option<String> {
    resolve_secret("FEISHU_APP_SECRET", config.channels.feishu.app_secret.as_ref())
}

/// Resolve the WeCom app secret: env WECOM_SECRET overrides config.
pub fn resolve_wecom_secret(config: &Config) -> Option<String> {
    resolve_secret("WECOM_SECRET", config.channels.wecom.secret.as_ref())
}

/// Resolve the backend base URL: env CLAWGATE_BACKEND_URL overrides config.
pub fn resolve_backend_url(config: &Config) -> Option<String> {
    resolve_secret("CLAWGATE_BACKEND_URL", config.agents.base_url.as_ref())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CLAWGATE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".clawgate").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Resolve workspace directory for the system prompt (AGENTS.md, SOUL.md, memory/).
pub fn resolve_workspace_dir(config: &Config) -> Option<PathBuf> {
    config
        .agents
        .workspace
        .clone()
        .or_else(|| dirs::home_dir().map(|h| h.join(".clawgate").join("workspace")))
}

/// Skill root: `skills.directory` when set, otherwise `<workspace>/skills`.
pub fn resolve_skills_dir(config: &Config) -> Option<PathBuf> {
    match &config.skills.directory {
        Some(d) if !d.as_os_str().is_empty() => Some(d.clone()),
        _ => resolve_workspace_dir(config).map(|w| w.join("skills")),
    }
}

/// Load config from the given path, else the default path (or CLAWGATE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        read_config(&path)?
    };
    Ok((config, path))
}

fn read_config(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parsing config from {}", path.display()))
}
