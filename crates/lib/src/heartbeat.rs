//! Liveness self-check against the reasoning backend with escalation.
//!
//! Escalation fires once per failure episode: when consecutive failures reach the
//! threshold one notice goes to the admin conversation, and nothing more is sent
//! until a success resets the counter.

use crate::backend::ReasoningBackend;
use crate::config::HeartbeatConfig;
use crate::intake::IntakeQueue;
use crate::message::{Channel, Message, Origin};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub interval: Duration,
    pub failure_threshold: u32,
    /// An escalation was sent for the current failure episode.
    pub escalated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Backend answered. `recovered` when this ended a failure episode.
    Healthy { recovered: bool },
    Failed { consecutive: u32 },
    /// Failed and the escalation notice was queued on this run.
    Escalated { consecutive: u32 },
}

impl HeartbeatOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HeartbeatOutcome::Healthy { .. })
    }
}

pub struct HeartbeatMonitor {
    backend: Arc<dyn ReasoningBackend>,
    intake: IntakeQueue,
    admin: Option<(Channel, String)>,
    timeout: Duration,
    record: Mutex<HeartbeatRecord>,
}

impl HeartbeatMonitor {
    pub fn new(backend: Arc<dyn ReasoningBackend>, intake: IntakeQueue, cfg: &HeartbeatConfig) -> Self {
        let admin = match (cfg.admin_channel, cfg.admin_conversation_id.as_deref()) {
            (Some(ch), Some(conv)) if !conv.trim().is_empty() => Some((ch, conv.trim().to_string())),
            _ => None,
        };
        if admin.is_none() {
            log::warn!("heartbeat: no admin channel configured, escalations will only be logged");
        }
        Self {
            backend,
            intake,
            admin,
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            record: Mutex::new(HeartbeatRecord {
                last_success_at: None,
                consecutive_failures: 0,
                interval: Duration::from_secs(cfg.interval_secs),
                failure_threshold: cfg.failure_threshold.max(1),
                escalated: false,
            }),
        }
    }

    pub async fn record(&self) -> HeartbeatRecord {
        self.record.lock().await.clone()
    }

    /// One self-check.
    pub async fn run_once(&self) -> HeartbeatOutcome {
        let result = match tokio::time::timeout(self.timeout, self.backend.check()).await {
            Ok(r) => r.map_err(|e| e.to_string()),
            Err(_) => Err(format!("no answer within {:?}", self.timeout)),
        };
        let mut rec = self.record.lock().await;
        match result {
            Ok(()) => {
                let recovered = rec.consecutive_failures > 0;
                if recovered {
                    log::info!(
                        "heartbeat: backend recovered after {} failure(s)",
                        rec.consecutive_failures
                    );
                }
                rec.consecutive_failures = 0;
                rec.escalated = false;
                rec.last_success_at = Some(Utc::now());
                HeartbeatOutcome::Healthy { recovered }
            }
            Err(reason) => {
                rec.consecutive_failures += 1;
                let n = rec.consecutive_failures;
                log::warn!("heartbeat: check failed ({} in a row): {}", n, reason);
                if n < rec.failure_threshold || rec.escalated {
                    return HeartbeatOutcome::Failed { consecutive: n };
                }
                if self.escalate(&rec, &reason) {
                    rec.escalated = true;
                    HeartbeatOutcome::Escalated { consecutive: n }
                } else {
                    HeartbeatOutcome::Failed { consecutive: n }
                }
            }
        }
    }

    /// Queue the escalation notice. False when it could not be queued; the next failure retries.
    fn escalate(&self, rec: &HeartbeatRecord, reason: &str) -> bool {
        let since = rec
            .last_success_at
            .map(|t| format!("last success {}", t.format("%Y-%m-%d %H:%M:%S UTC")))
            .unwrap_or_else(|| "no success since start".to_string());
        let text = format!(
            "[clawgate] reasoning backend unhealthy: {} consecutive heartbeat failures ({}). last error: {}",
            rec.consecutive_failures, since, reason
        );
        let Some((channel, conv)) = &self.admin else {
            log::error!("heartbeat: {}", text);
            return true;
        };
        match self
            .intake
            .submit(Message::synthetic(*channel, conv.clone(), text, Origin::Notice))
        {
            Ok(()) => {
                log::error!("heartbeat: escalated to {}:{}", channel, conv);
                true
            }
            Err(e) => {
                log::error!("heartbeat: could not queue escalation: {}", e);
                false
            }
        }
    }
}
