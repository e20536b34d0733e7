//! Job bodies for the gateway's scheduler.

use crate::heartbeat::HeartbeatMonitor;
use crate::intake::IntakeQueue;
use crate::message::{Message, Origin};
use crate::scheduler::{JobExecutor, JobKind};
use crate::session::SessionStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Runs scheduled jobs against the gateway's shared parts. Jobs that talk to a user
/// go through the intake queue like any platform message.
pub struct GatewayJobs {
    pub intake: IntakeQueue,
    pub sessions: Arc<SessionStore>,
    pub heartbeat: Option<Arc<HeartbeatMonitor>>,
}

#[async_trait]
impl JobExecutor for GatewayJobs {
    async fn execute(&self, job_id: &str, kind: &JobKind) -> anyhow::Result<()> {
        match kind {
            JobKind::PeriodicPrompt {
                prompt,
                channel,
                conversation_id,
            } => {
                let msg = Message::synthetic(*channel, conversation_id.clone(), prompt.clone(), Origin::Scheduled);
                self.intake.submit(msg)?;
                log::debug!("jobs: {} queued prompt for {}:{}", job_id, channel, conversation_id);
                Ok(())
            }
            JobKind::EvictSessions => {
                let evicted = self.sessions.evict_expired(Instant::now()).await;
                if evicted > 0 {
                    log::info!("jobs: evicted {} idle session(s)", evicted);
                }
                Ok(())
            }
            JobKind::Heartbeat => {
                let Some(ref hb) = self.heartbeat else {
                    anyhow::bail!("heartbeat monitor not configured");
                };
                let outcome = hb.run_once().await;
                if outcome.is_healthy() {
                    Ok(())
                } else {
                    anyhow::bail!("backend unhealthy: {:?}", outcome)
                }
            }
        }
    }
}
