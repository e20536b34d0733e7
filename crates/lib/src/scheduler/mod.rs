//! Job scheduler: jobs ordered by next run time in a min-heap, one timer loop.
//!
//! The loop sleeps until the soonest `next_run_at` or until a job is registered or
//! cancelled, then spawns every due job with its own timeout. A job's next run time is
//! computed before it is spawned, so it advances whether the run succeeds, fails or hangs.

mod job;
mod schedule;

pub use job::{JobExecutor, JobKind, JobStatus, ScheduledJob};
pub use schedule::{parse_cron, Schedule};

use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Loop wake-up when no job is scheduled.
const IDLE_WAKE: Duration = Duration::from_secs(60);

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, ScheduledJob>,
    /// (next_run_at, id). Entries whose time no longer matches the job are stale and skipped.
    queue: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
}

impl SchedulerState {
    fn is_current(&self, at: &DateTime<Utc>, id: &str) -> bool {
        self.jobs
            .get(id)
            .map(|j| j.next_run_at.as_ref() == Some(at))
            .unwrap_or(false)
    }

    /// Soonest live entry, dropping stale ones on the way.
    fn peek_next(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((at, id))) = self.queue.peek() {
            if self.is_current(at, id) {
                return Some(*at);
            }
            self.queue.pop();
        }
        None
    }
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    wake: Notify,
    executor: Arc<dyn JobExecutor>,
    tasks: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            wake: Notify::new(),
            executor,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Add or replace a job; its first run is the schedule's next time after now.
    pub async fn register(&self, mut job: ScheduledJob) -> Result<DateTime<Utc>> {
        let next = job.schedule.next_after(Utc::now()).ok_or_else(|| {
            GatewayError::Config(format!("job {} ({}) has no future runs", job.id, job.schedule.describe()))
        })?;
        job.next_run_at = Some(next);
        log::info!(
            "scheduler: registered {} [{}] {}, first run {}",
            job.id,
            job.kind.label(),
            job.schedule.describe(),
            next
        );
        {
            let mut st = self.state.lock().await;
            st.queue.push(Reverse((next, job.id.clone())));
            st.jobs.insert(job.id.clone(), job);
        }
        self.wake.notify_one();
        Ok(next)
    }

    /// Remove a job. A run already in progress finishes.
    pub async fn cancel(&self, id: &str) -> bool {
        let removed = self.state.lock().await.jobs.remove(id).is_some();
        if removed {
            log::info!("scheduler: cancelled {}", id);
            self.wake.notify_one();
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<ScheduledJob> {
        self.state.lock().await.jobs.get(id).cloned()
    }

    /// Jobs sorted by next run time.
    pub async fn list(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.state.lock().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub async fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.peek_next()
    }

    /// Timer loop. Returns after `cancel` fires and running jobs have finished or timed out.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        log::info!("scheduler: started");
        loop {
            let wait = match self.next_wake().await {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => IDLE_WAKE,
            };
            if !wait.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.wake.notified() => {
                        log::debug!("scheduler: woken by job change");
                        continue;
                    }
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            self.run_due(Utc::now()).await;
        }
        log::info!("scheduler: stopping, waiting for running jobs");
        self.drain().await;
        log::info!("scheduler: stopped");
    }

    /// Spawn every job due at `now`. Returns how many were started.
    pub async fn run_due(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let mut started = Vec::new();
        {
            let mut st = self.state.lock().await;
            while let Some(Reverse((at, _))) = st.queue.peek() {
                if *at > now {
                    break;
                }
                let Some(Reverse((at, id))) = st.queue.pop() else {
                    break;
                };
                if !st.is_current(&at, &id) {
                    continue;
                }
                let Some(job) = st.jobs.get_mut(&id) else {
                    continue;
                };
                let next = job.schedule.next_after(now.max(at));
                job.next_run_at = next;
                if job.running {
                    log::warn!("scheduler: {} still running, skipping this run", id);
                    job.last_status = Some(JobStatus::Skipped);
                } else {
                    job.running = true;
                    job.last_run_at = Some(now);
                    started.push((id.clone(), job.kind.clone(), job.timeout));
                }
                match next {
                    Some(n) => st.queue.push(Reverse((n, id))),
                    None => log::warn!("scheduler: {} has no future runs", id),
                }
            }
        }
        let count = started.len();
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        for (id, kind, timeout) in started {
            let this = self.clone();
            tasks.spawn(async move {
                log::debug!("scheduler: running {} [{}]", id, kind.label());
                let status = match tokio::time::timeout(timeout, this.executor.execute(&id, &kind)).await {
                    Ok(Ok(())) => JobStatus::Ok,
                    Ok(Err(e)) => {
                        log::warn!("scheduler: {} failed: {:#}", id, e);
                        JobStatus::Failed(format!("{:#}", e))
                    }
                    Err(_) => {
                        log::warn!("scheduler: {} timed out after {:?}", id, timeout);
                        JobStatus::TimedOut
                    }
                };
                let mut st = this.state.lock().await;
                if let Some(job) = st.jobs.get_mut(&id) {
                    job.running = false;
                    job.runs += 1;
                    job.last_status = Some(status);
                }
            });
        }
        count
    }

    /// Wait for every spawned job run to finish.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while tasks.join_next().await.is_some() {}
    }
}
