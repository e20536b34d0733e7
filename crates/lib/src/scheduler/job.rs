//! Scheduled job model and the executor seam.

use super::schedule::Schedule;
use crate::message::Channel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// Send `prompt` to the backend as a synthetic message; the reply goes to the conversation.
    PeriodicPrompt {
        prompt: String,
        channel: Channel,
        conversation_id: String,
    },
    /// Backend liveness self-check with escalation.
    Heartbeat,
    /// Drop idle sessions from the session store.
    EvictSessions,
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::PeriodicPrompt { .. } => "periodic-prompt",
            JobKind::Heartbeat => "heartbeat",
            JobKind::EvictSessions => "evict-sessions",
        }
    }
}

/// Outcome of the last execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Ok,
    Failed(String),
    TimedOut,
    /// The previous run was still going when the job came due again.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: String,
    pub schedule: Schedule,
    pub kind: JobKind,
    pub timeout: Duration,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<JobStatus>,
    pub running: bool,
    pub runs: u64,
}

impl ScheduledJob {
    pub fn new(id: impl Into<String>, schedule: Schedule, kind: JobKind, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            schedule,
            kind,
            timeout,
            next_run_at: None,
            last_run_at: None,
            last_status: None,
            running: false,
            runs: 0,
        }
    }
}

/// Runs a job body. Errors are logged and recorded; they never unschedule the job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job_id: &str, kind: &JobKind) -> anyhow::Result<()>;
}
