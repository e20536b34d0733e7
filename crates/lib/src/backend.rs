//! Reasoning backend boundary and the Ollama implementation (http://127.0.0.1:11434 by default).
//!
//! The gateway only sees `run(prompt, session_id) -> output`. The backend owns per-session
//! conversation history; evicting a gateway session never touches it. History is bounded
//! per session and by the number of sessions kept (least recently used dropped first).

use crate::config::{self, Config};
use crate::error::{GatewayError, Result};
use crate::prompt::{build_system_prompt, with_current_date};
use crate::skills::{load_skills, Skill};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "llama3.2:latest";
/// Turns (user + assistant) kept per reasoning session.
const MAX_HISTORY_MESSAGES: usize = 40;
/// Reasoning sessions with history kept at once.
const MAX_HISTORY_SESSIONS: usize = 1024;

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub prompt: String,
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub output: String,
}

/// The agent-reasoning backend. The dispatcher is the only caller of `run` and bounds every call.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn run(&self, req: BackendRequest) -> Result<BackendResponse>;

    /// Cheap liveness probe for the heartbeat.
    async fn check(&self) -> Result<()>;

    /// Drop any state kept for `session_id` (the conversation moved to a new session).
    async fn forget(&self, _session_id: &str) {}

    /// Release resources at shutdown.
    async fn close(&self) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Option<Vec<OllamaModel>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
}

/// Ollama chat backend with in-memory history per reasoning session.
pub struct OllamaBackend {
    base_url: String,
    model: String,
    system_prompt: String,
    client: reqwest::Client,
    history: Mutex<HashMap<String, History>>,
    max_sessions: usize,
}

#[derive(Default)]
struct History {
    turns: Vec<ChatMessage>,
    last_used: Option<Instant>,
}

fn classify(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::BackendTransient(format!("ollama request timed out: {}", err))
    } else if err.is_decode() {
        GatewayError::BackendFatal(format!("ollama response: {}", err))
    } else {
        GatewayError::BackendTransient(format!("ollama request failed: {}", err))
    }
}

fn status_error(status: reqwest::StatusCode, body: &str) -> GatewayError {
    let msg = format!("ollama api error: {} {}", status, body);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        GatewayError::BackendTransient(msg)
    } else {
        GatewayError::BackendFatal(msg)
    }
}

impl OllamaBackend {
    pub fn new(
        base_url: Option<String>,
        model: Option<String>,
        system_prompt: String,
        request_timeout: Duration,
    ) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt,
            client,
            history: Mutex::new(HashMap::new()),
            max_sessions: MAX_HISTORY_SESSIONS,
        }
    }

    /// Keep history for at most `max` reasoning sessions.
    pub fn with_history_capacity(mut self, max: usize) -> Self {
        self.max_sessions = max.max(1);
        self
    }

    /// Build from config: resolves base URL (env override), model, workspace system prompt and skills.
    pub fn from_config(config: &Config) -> Self {
        let workspace = config::resolve_workspace_dir(config);
        let skills = load_configured_skills(config);
        let system_prompt = build_system_prompt(workspace.as_deref(), &skills);
        log::info!(
            "backend: ollama model {} ({} skills, system prompt {} chars)",
            config.agents.default_model.as_deref().unwrap_or(DEFAULT_MODEL),
            skills.len(),
            system_prompt.len()
        );
        Self::new(
            config::resolve_backend_url(config),
            config.agents.default_model.clone(),
            system_prompt,
            Duration::from_secs(config.agents.request_timeout_secs.max(1)),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// GET /api/tags: list available models.
    pub async fn list_models(&self) -> Result<Vec<OllamaModel>> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self.client.get(&url).send().await.map_err(classify)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let data: TagsResponse = res.json().await.map_err(classify)?;
        Ok(data.models.unwrap_or_default())
    }

    /// POST /api/chat, non-streaming.
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
        };
        let res = self.client.post(&url).json(&body).send().await.map_err(classify)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let data: ChatResponse = res.json().await.map_err(classify)?;
        Ok(data.message.map(|m| m.content).unwrap_or_default())
    }

    async fn session_history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.history
            .lock()
            .await
            .get(session_id)
            .map(|h| h.turns.clone())
            .unwrap_or_default()
    }

    async fn record_turn(&self, session_id: &str, prompt: &str, output: &str) {
        let mut g = self.history.lock().await;
        let entry = g.entry(session_id.to_string()).or_default();
        entry.last_used = Some(Instant::now());
        let turns = &mut entry.turns;
        turns.push(ChatMessage::new("user", prompt));
        turns.push(ChatMessage::new("assistant", output));
        if turns.len() > MAX_HISTORY_MESSAGES {
            let excess = turns.len() - MAX_HISTORY_MESSAGES;
            turns.drain(..excess);
        }
        while g.len() > self.max_sessions {
            let Some(oldest) = g
                .iter()
                .min_by_key(|(_, h)| h.last_used)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            log::debug!("backend: dropping history for idle session {}", oldest);
            g.remove(&oldest);
        }
    }

    async fn history_sessions(&self) -> usize {
        self.history.lock().await.len()
    }
}

/// Skills from the configured directory when enabled; load errors are logged and yield none.
pub fn load_configured_skills(config: &Config) -> Vec<Skill> {
    if !config.skills.enabled {
        return Vec::new();
    }
    let Some(dir) = config::resolve_skills_dir(config) else {
        return Vec::new();
    };
    match load_skills(&dir) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("backend: loading skills from {}: {}", dir.display(), e);
            Vec::new()
        }
    }
}

#[async_trait]
impl ReasoningBackend for OllamaBackend {
    async fn run(&self, req: BackendRequest) -> Result<BackendResponse> {
        let mut messages = vec![ChatMessage::new("system", with_current_date(&self.system_prompt))];
        messages.extend(self.session_history(&req.session_id).await);
        messages.push(ChatMessage::new("user", req.prompt.clone()));
        let output = self.chat(messages).await?;
        self.record_turn(&req.session_id, &req.prompt, &output).await;
        Ok(BackendResponse { output })
    }

    async fn check(&self) -> Result<()> {
        self.list_models().await.map(|_| ())
    }

    async fn forget(&self, session_id: &str) {
        if self.history.lock().await.remove(session_id).is_some() {
            log::debug!("backend: forgot history for {}", session_id);
        }
    }

    async fn close(&self) {
        let sessions = {
            let mut g = self.history.lock().await;
            let n = g.len();
            g.clear();
            n
        };
        log::debug!("backend: closed, dropped history for {} sessions", sessions);
    }
}
