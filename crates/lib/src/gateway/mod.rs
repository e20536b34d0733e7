//! Gateway process: channel adapters, webhook server, dispatcher workers, scheduler.
//!
//! Every long-running task shares one `CancellationToken`. On SIGINT/SIGTERM the server
//! stops accepting, the poller and scheduler stop, workers finish the message they hold,
//! and the backend is closed last.

mod jobs;
mod server;

pub use jobs::GatewayJobs;
pub use server::router;

use crate::backend::{OllamaBackend, ReasoningBackend};
use crate::channels::{ChannelAdapter, ChannelRegistry, FeishuChannel, TelegramChannel, WeComChannel};
use crate::config::{self, Config};
use crate::dedup::RecentlySeen;
use crate::dispatcher::{spawn_workers, DispatchPolicy, Dispatcher};
use crate::error::GatewayError;
use crate::heartbeat::HeartbeatMonitor;
use crate::intake::intake_queue;
use crate::scheduler::{JobKind, Schedule, ScheduledJob, Scheduler};
use crate::session::SessionStore;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bound on one eviction pass.
const EVICT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// Enabled channel adapters. A channel whose config fails validation is logged and left out.
pub struct Channels {
    pub adapters: Vec<Arc<dyn ChannelAdapter>>,
    pub telegram: Option<Arc<TelegramChannel>>,
}

pub fn build_channels(config: &Config) -> Channels {
    let mut adapters: Vec<Arc<dyn ChannelAdapter>> = Vec::new();
    let mut telegram = None;
    let ch = &config.channels;
    if ch.telegram.enabled {
        match TelegramChannel::from_config(&ch.telegram, config::resolve_telegram_token(config)) {
            Ok(t) => {
                let t = Arc::new(t);
                adapters.push(t.clone());
                telegram = Some(t);
            }
            Err(e) => log::error!("gateway: telegram channel disabled: {}", e),
        }
    }
    if ch.feishu.enabled {
        match FeishuChannel::from_config(&ch.feishu, config::resolve_feishu_secret(config)) {
            Ok(f) => add_unique(&mut adapters, Arc::new(f)),
            Err(e) => log::error!("gateway: feishu channel disabled: {}", e),
        }
    }
    if ch.wecom.enabled {
        match WeComChannel::from_config(&ch.wecom, config::resolve_wecom_secret(config)) {
            Ok(w) => add_unique(&mut adapters, Arc::new(w)),
            Err(e) => log::error!("gateway: wecom channel disabled: {}", e),
        }
    }
    Channels { adapters, telegram }
}

/// Add `adapter` unless an earlier channel already owns its webhook path.
fn add_unique(adapters: &mut Vec<Arc<dyn ChannelAdapter>>, adapter: Arc<dyn ChannelAdapter>) {
    if let Some(owner) = adapters.iter().find(|a| a.endpoint_path() == adapter.endpoint_path()) {
        let e = GatewayError::Config(format!(
            "endpointPath {} already used by {}",
            adapter.endpoint_path(),
            owner.channel()
        ));
        log::error!("gateway: {} channel disabled: {}", adapter.channel(), e);
        return;
    }
    adapters.push(adapter);
}

/// Scheduled jobs from config: session eviction, heartbeat (when enabled) and periodic prompts.
/// Invalid cron entries are logged and skipped.
pub fn configured_jobs(config: &Config) -> Vec<ScheduledJob> {
    let mut jobs = Vec::new();
    match Schedule::every(Duration::from_secs(config.sessions.evict_interval_secs)) {
        Ok(s) => jobs.push(ScheduledJob::new("evict-sessions", s, JobKind::EvictSessions, EVICT_JOB_TIMEOUT)),
        Err(e) => log::warn!("gateway: session eviction disabled: {}", e),
    }
    let hb = &config.heartbeat;
    if hb.enabled {
        match Schedule::every(Duration::from_secs(hb.interval_secs)) {
            Ok(s) => jobs.push(ScheduledJob::new(
                "heartbeat",
                s,
                JobKind::Heartbeat,
                Duration::from_secs(hb.timeout_secs.max(1) + 5),
            )),
            Err(e) => log::warn!("gateway: heartbeat disabled: {}", e),
        }
    }
    for c in &config.cron {
        let schedule = match (c.cron.as_deref(), c.every_secs) {
            (Some(expr), _) => Schedule::cron(expr),
            (None, Some(secs)) => Schedule::every(Duration::from_secs(secs)),
            (None, None) => {
                log::warn!("gateway: cron job {} has neither cron nor everySecs, skipped", c.id);
                continue;
            }
        };
        match schedule {
            Ok(s) => jobs.push(ScheduledJob::new(
                c.id.clone(),
                s,
                JobKind::PeriodicPrompt {
                    prompt: c.prompt.clone(),
                    channel: c.channel,
                    conversation_id: c.conversation_id.clone(),
                },
                Duration::from_secs(c.timeout_secs.max(1)),
            )),
            Err(e) => log::warn!("gateway: cron job {} skipped: {}", c.id, e),
        }
    }
    jobs
}

/// Run the gateway; binds to config.gateway.bind:config.gateway.port.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    log::info!("gateway: config {}", config_path.display());
    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let Channels { adapters, telegram } = build_channels(&config);
    if adapters.is_empty() {
        log::warn!("gateway: no channel enabled; only the scheduler and health endpoint will run");
    }
    let registry = Arc::new(ChannelRegistry::new());
    for a in &adapters {
        registry.register(a.clone()).await;
    }

    let backend = Arc::new(OllamaBackend::from_config(&config));
    {
        let probe = backend.clone();
        tokio::spawn(async move {
            match probe.list_models().await {
                Ok(list) => log::info!("backend: {} model(s) available", list.len()),
                Err(e) => log::warn!("backend: model discovery failed: {}", e),
            }
        });
    }
    let backend: Arc<dyn ReasoningBackend> = backend;

    let (intake, intake_rx) = intake_queue(config.gateway.queue_depth);
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(config.sessions.idle_ttl_secs)));
    let dispatcher = Arc::new(Dispatcher::new(
        sessions.clone(),
        registry.clone(),
        backend.clone(),
        RecentlySeen::new(
            Duration::from_secs(config.gateway.dedup_window_secs),
            config.gateway.dedup_capacity,
        ),
        DispatchPolicy::from_config(&config.dispatch),
    ));
    let workers = spawn_workers(dispatcher, intake_rx, config.gateway.workers, cancel.clone());
    log::info!("gateway: {} dispatcher worker(s), intake depth {}", workers.len(), intake.capacity());

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut telegram_webhook = None;
    if let Some(t) = telegram {
        match config.channels.telegram.webhook_url.as_deref() {
            Some(url) => {
                if let Err(e) = t.set_webhook(url).await {
                    log::warn!("telegram: set_webhook failed: {}", e);
                } else {
                    log::info!("telegram: webhook mode: {}", url);
                }
                telegram_webhook = Some(t);
            }
            None => tasks.push(t.start_polling(intake.clone(), cancel.clone())),
        }
    }

    let heartbeat = config
        .heartbeat
        .enabled
        .then(|| Arc::new(HeartbeatMonitor::new(backend.clone(), intake.clone(), &config.heartbeat)));
    let scheduler = Arc::new(Scheduler::new(Arc::new(GatewayJobs {
        intake: intake.clone(),
        sessions,
        heartbeat,
    })));
    for job in configured_jobs(&config) {
        if let Err(e) = scheduler.register(job).await {
            log::warn!("gateway: {}", e);
        }
    }
    tasks.push(tokio::spawn(scheduler.clone().run(cancel.clone())));

    let app = router(adapters, intake);
    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    tokio::spawn(shutdown_signal(cancel.clone()));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("gateway server exited");

    cancel.cancel();
    registry.stop_all().await;
    if let Some(t) = telegram_webhook {
        if let Err(e) = t.delete_webhook().await {
            log::debug!("telegram delete_webhook on shutdown: {}", e);
        }
    }
    for h in tasks {
        let _ = h.await;
    }
    for h in workers {
        let _ = h.await;
    }
    backend.close().await;
    log::info!("gateway stopped");
    served
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel.cancelled() => return,
    }
    log::info!("shutdown signal received, draining");
    cancel.cancel();
}
