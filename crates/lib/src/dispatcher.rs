//! Dispatcher: dedup, per-session serialization, backend calls with timeout and retry,
//! and reply delivery through the originating channel.
//!
//! Per session key the state machine is Idle -> Dispatching -> Idle. Messages arriving
//! while Dispatching wait in the session's FIFO and are drained by the worker that owns
//! the in-flight call, so a session never has two backend calls at once.
//!
//! Workers admit a message while still holding the intake receiver, so messages of one
//! conversation enter its FIFO in arrival order however many workers run.

use crate::backend::{BackendRequest, ReasoningBackend};
use crate::channels::{split_text, ChannelAdapter, ChannelRegistry};
use crate::config::DispatchConfig;
use crate::dedup::RecentlySeen;
use crate::error::{GatewayError, Result};
use crate::intake::IntakeReceiver;
use crate::message::{Channel, Message, Origin};
use crate::session::{Admission, SessionKey, SessionStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Message that starts a new reasoning session for the conversation. Case-insensitive.
const NEW_SESSION_TRIGGER: &str = "/new";
const NEW_SESSION_REPLY: &str = "session restarted. next message will start with a clean history.";

/// Timeout, retry and delivery policy.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub call_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub delivery_attempts: u32,
    pub fallback_text: String,
}

impl DispatchPolicy {
    pub fn from_config(cfg: &DispatchConfig) -> Self {
        Self {
            call_timeout: cfg.call_timeout(),
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms.max(cfg.backoff_base_ms)),
            delivery_attempts: cfg.delivery_attempts.max(1),
            fallback_text: cfg.fallback_text.clone(),
        }
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Result of [`Dispatcher::admit`].
#[derive(Debug)]
pub enum Claim {
    /// The caller owns the session and must run it with [`Dispatcher::run_session`].
    Owned(SessionKey, Message),
    /// Nothing left for the caller to do.
    Settled(DispatchOutcome),
}

/// What `handle` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Idempotency key seen inside the dedup window; dropped.
    Duplicate,
    /// Another call for the session is in flight; queued behind it.
    Queued { position: usize },
    /// This call owned the session and processed this many messages (its own plus drained ones).
    Processed(usize),
}

pub struct Dispatcher {
    sessions: Arc<SessionStore>,
    registry: Arc<ChannelRegistry>,
    backend: Arc<dyn ReasoningBackend>,
    recent: Mutex<RecentlySeen>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<ChannelRegistry>,
        backend: Arc<dyn ReasoningBackend>,
        recent: RecentlySeen,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            sessions,
            registry,
            backend,
            recent: Mutex::new(recent),
            policy,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Handle one inbound message. Never fails: every error is contained to the message and
    /// ends in a reply, a fallback or a log line.
    pub async fn handle(&self, msg: Message) -> DispatchOutcome {
        match self.admit(msg).await {
            Claim::Owned(key, msg) => DispatchOutcome::Processed(self.run_session(&key, msg).await),
            Claim::Settled(outcome) => outcome,
        }
    }

    /// Dedup the message and place it in its session: either the caller now owns the
    /// session or the message waits in the session FIFO. Never calls the backend.
    pub async fn admit(&self, msg: Message) -> Claim {
        let fresh = self
            .recent
            .lock()
            .await
            .check_and_insert(msg.idempotency_key(), Instant::now());
        if !fresh {
            log::debug!("dispatcher: duplicate {} dropped", msg.idempotency_key());
            return Claim::Settled(DispatchOutcome::Duplicate);
        }
        let key = SessionKey::of(&msg);
        match self.sessions.admit(msg).await {
            Admission::Queued { position } => {
                log::debug!("dispatcher: {} busy, queued at {}", key, position);
                Claim::Settled(DispatchOutcome::Queued { position })
            }
            Admission::Dispatch(_, msg) => Claim::Owned(key, msg),
        }
    }

    /// Process `first` and then every message queued behind it until the session is idle.
    /// Returns how many messages were processed.
    pub async fn run_session(&self, key: &SessionKey, first: Message) -> usize {
        let mut current = first;
        let mut processed = 0;
        loop {
            self.process(key, &current).await;
            processed += 1;
            match self.sessions.finish(key).await {
                Some(next) => current = next,
                None => break,
            }
        }
        processed
    }

    async fn process(&self, key: &SessionKey, msg: &Message) {
        let channel = msg.channel();
        let conv = msg.conversation_id();
        if msg.origin() == Origin::Notice {
            self.deliver(channel, conv, msg.text()).await;
            return;
        }
        if msg.origin() == Origin::Platform && msg.text().trim().eq_ignore_ascii_case(NEW_SESSION_TRIGGER) {
            let old = self.sessions.reasoning_session_id(key).await;
            let id = self.sessions.reset(key).await;
            self.backend.forget(&old).await;
            log::info!("dispatcher: {} restarted as {}", key, id);
            self.deliver(channel, conv, NEW_SESSION_REPLY).await;
            return;
        }
        let session_id = self.sessions.reasoning_session_id(key).await;
        let reply = match self.call_backend(msg.text(), &session_id).await {
            Ok(output) if !output.trim().is_empty() => output,
            Ok(_) => {
                log::warn!("dispatcher: empty reply for {}, sending fallback", key);
                self.policy.fallback_text.clone()
            }
            Err(e) => {
                log::error!("dispatcher: backend failed for {} ({}), sending fallback", key, e);
                self.policy.fallback_text.clone()
            }
        };
        self.deliver(channel, conv, &reply).await;
        self.sessions.touch(key).await;
    }

    /// Call the backend under the per-call timeout, retrying timeouts and transient errors with backoff.
    async fn call_backend(&self, prompt: &str, session_id: &str) -> Result<String> {
        let mut attempt = 1;
        loop {
            let req = BackendRequest {
                prompt: prompt.to_string(),
                session_id: session_id.to_string(),
            };
            let result = match tokio::time::timeout(self.policy.call_timeout, self.backend.run(req)).await {
                Ok(r) => r,
                Err(_) => Err(GatewayError::BackendTimeout(self.policy.call_timeout)),
            };
            match result {
                Ok(resp) => return Ok(resp.output),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    log::warn!(
                        "dispatcher: backend attempt {}/{} for {} failed ({}), retrying in {:?}",
                        attempt,
                        self.policy.max_attempts,
                        session_id,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send `text` through the channel's adapter, split to the platform's message limit.
    /// Each part is retried on its own so parts already delivered are never sent twice.
    /// Returns false when any part is undelivered.
    pub async fn deliver(&self, channel: Channel, conversation_id: &str, text: &str) -> bool {
        let Some(adapter) = self.registry.get(channel).await else {
            log::error!("dispatcher: no {} adapter, reply to {} undelivered", channel, conversation_id);
            return false;
        };
        let parts = split_text(text, adapter.max_message_chars());
        let total = parts.len();
        for (i, part) in parts.iter().enumerate() {
            if !self.send_part(adapter.as_ref(), channel, conversation_id, part).await {
                if i > 0 {
                    log::error!(
                        "dispatcher: reply to {}:{} cut after part {}/{}",
                        channel,
                        conversation_id,
                        i,
                        total
                    );
                }
                return false;
            }
        }
        true
    }

    async fn send_part(
        &self,
        adapter: &dyn ChannelAdapter,
        channel: Channel,
        conversation_id: &str,
        text: &str,
    ) -> bool {
        let mut attempt = 1;
        loop {
            match adapter.send(conversation_id, text).await {
                Ok(()) => return true,
                Err(e) if e.is_retryable() && attempt < self.policy.delivery_attempts => {
                    let delay = self.policy.backoff(attempt);
                    log::warn!(
                        "dispatcher: send to {}:{} failed ({}), retrying in {:?}",
                        channel,
                        conversation_id,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("dispatcher: reply to {}:{} undelivered: {}", channel, conversation_id, e);
                    return false;
                }
            }
        }
    }
}

/// Start `count` workers draining the intake queue. Workers stop taking new messages once
/// `cancel` fires; a message already taken is processed to completion.
pub fn spawn_workers(
    dispatcher: Arc<Dispatcher>,
    intake: IntakeReceiver,
    count: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|i| {
            let dispatcher = dispatcher.clone();
            let intake = intake.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let mut rx = tokio::select! {
                        _ = cancel.cancelled() => break,
                        g = intake.lock() => g,
                    };
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => break,
                        m = rx.recv() => m,
                    };
                    let Some(msg) = msg else {
                        break;
                    };
                    let claim = dispatcher.admit(msg).await;
                    drop(rx);
                    if let Claim::Owned(key, msg) = claim {
                        dispatcher.run_session(&key, msg).await;
                    }
                }
                log::debug!("dispatcher: worker {} stopped", i);
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendResponse;
    use crate::channels::{ChannelAdapter, Inbound, RawRequest};
    use crate::intake::intake_queue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Backend that records prompts, tracks concurrency per session and replies "re: <prompt>".
    #[derive(Default)]
    struct FakeBackend {
        delay: Duration,
        fail_transient: bool,
        prompts: StdMutex<Vec<String>>,
        in_flight: StdMutex<std::collections::HashMap<String, usize>>,
        max_concurrent_per_session: AtomicUsize,
        calls: AtomicUsize,
        forgotten: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ReasoningBackend for FakeBackend {
        async fn run(&self, req: BackendRequest) -> Result<BackendResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut g = self.in_flight.lock().unwrap();
                let n = g.entry(req.session_id.clone()).or_default();
                *n += 1;
                self.max_concurrent_per_session.fetch_max(*n, Ordering::SeqCst);
            }
            tokio::time::sleep(self.delay).await;
            *self.in_flight.lock().unwrap().get_mut(&req.session_id).unwrap() -= 1;
            if self.fail_transient {
                return Err(GatewayError::BackendTransient("503".to_string()));
            }
            self.prompts.lock().unwrap().push(req.prompt.clone());
            Ok(BackendResponse {
                output: format!("re: {}", req.prompt),
            })
        }

        async fn check(&self) -> Result<()> {
            Ok(())
        }

        async fn forget(&self, session_id: &str) {
            self.forgotten.lock().unwrap().push(session_id.to_string());
        }
    }

    /// Adapter that records every send.
    #[derive(Default)]
    struct RecordingAdapter {
        sent: StdMutex<Vec<(String, String)>>,
        failures_left: AtomicUsize,
        max_chars: Option<usize>,
        /// 1-based send attempt that fails once with a transient error.
        fail_attempt: Option<usize>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn channel(&self) -> Channel {
            Channel::Telegram
        }
        fn endpoint_path(&self) -> &str {
            "/telegram/webhook"
        }
        fn verify(&self, _req: &RawRequest) -> Result<()> {
            Ok(())
        }
        fn normalize(&self, _req: &RawRequest) -> Result<Inbound> {
            Ok(Inbound::Ignored("test".to_string()))
        }
        async fn send(&self, conversation_id: &str, text: &str) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_attempt == Some(attempt) {
                return Err(GatewayError::delivery("502 from platform", true));
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GatewayError::delivery("502 from platform", true));
            }
            self.sent
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), text.to_string()));
            Ok(())
        }

        fn max_message_chars(&self) -> usize {
            self.max_chars.unwrap_or(4096)
        }
    }

    fn fast_policy() -> DispatchPolicy {
        DispatchPolicy {
            call_timeout: Duration::from_millis(200),
            max_attempts: 3,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            delivery_attempts: 3,
            fallback_text: "sorry, try again later".to_string(),
        }
    }

    async fn setup(backend: Arc<FakeBackend>) -> (Arc<Dispatcher>, Arc<RecordingAdapter>) {
        setup_with(backend, RecordingAdapter::default()).await
    }

    async fn setup_with(backend: Arc<FakeBackend>, adapter: RecordingAdapter) -> (Arc<Dispatcher>, Arc<RecordingAdapter>) {
        let registry = Arc::new(ChannelRegistry::new());
        let adapter = Arc::new(adapter);
        registry.register(adapter.clone()).await;
        let dispatcher = Dispatcher::new(
            Arc::new(SessionStore::new(Duration::from_secs(600))),
            registry,
            backend,
            RecentlySeen::new(Duration::from_secs(900), 1000),
            fast_policy(),
        );
        (Arc::new(dispatcher), adapter)
    }

    fn tg(conv: &str, text: &str, update_id: &str) -> Message {
        Message::inbound(Channel::Telegram, conv, "u1", text, Some(update_id))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = DispatchPolicy {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            ..fast_policy()
        };
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_millis(1000));
        assert_eq!(p.backoff(4), Duration::from_millis(4000));
        assert_eq!(p.backoff(6), Duration::from_secs(8));
        assert_eq!(p.backoff(40), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn duplicate_delivery_calls_backend_once() {
        let backend = Arc::new(FakeBackend::default());
        let (d, adapter) = setup(backend.clone()).await;
        assert_eq!(d.handle(tg("42", "hi", "1001")).await, DispatchOutcome::Processed(1));
        assert_eq!(d.handle(tg("42", "hi", "1001")).await, DispatchOutcome::Duplicate);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        let sent = adapter.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("42".to_string(), "re: hi".to_string())]);
    }

    #[tokio::test]
    async fn queued_messages_run_in_order_one_at_a_time() {
        let backend = Arc::new(FakeBackend {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let (d, adapter) = setup(backend.clone()).await;
        let first = {
            let d = d.clone();
            tokio::spawn(async move { d.handle(tg("7", "1", "a")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(d.handle(tg("7", "2", "b")).await, DispatchOutcome::Queued { position: 1 });
        assert_eq!(d.handle(tg("7", "3", "c")).await, DispatchOutcome::Queued { position: 2 });
        assert_eq!(first.await.unwrap(), DispatchOutcome::Processed(3));

        assert_eq!(*backend.prompts.lock().unwrap(), vec!["1", "2", "3"]);
        assert_eq!(backend.max_concurrent_per_session.load(Ordering::SeqCst), 1);
        let replies: Vec<String> = adapter.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
        assert_eq!(replies, vec!["re: 1", "re: 2", "re: 3"]);
        let session = d.sessions().get(&SessionKey::new(Channel::Telegram, "7")).await.unwrap();
        assert!(!session.in_flight);
    }

    #[tokio::test]
    async fn concurrent_workers_never_overlap_a_session() {
        let backend = Arc::new(FakeBackend {
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let (d, adapter) = setup(backend.clone()).await;
        let (queue, rx) = intake_queue(64);
        let cancel = CancellationToken::new();
        let workers = spawn_workers(d.clone(), rx, 4, cancel.clone());
        for i in 0..20 {
            let conv = if i % 2 == 0 { "even" } else { "odd" };
            queue.submit(tg(conv, &i.to_string(), &format!("u{}", i))).unwrap();
        }
        for _ in 0..200 {
            if adapter.sent.lock().unwrap().len() == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        for w in workers {
            w.await.unwrap();
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 20);
        assert_eq!(backend.max_concurrent_per_session.load(Ordering::SeqCst), 1);
        assert!(d.sessions().get(&SessionKey::new(Channel::Telegram, "even")).await.map(|s| !s.in_flight).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_conversation_keeps_arrival_order_across_workers() {
        let backend = Arc::new(FakeBackend::default());
        let (d, adapter) = setup(backend.clone()).await;
        let (queue, rx) = intake_queue(256);
        let cancel = CancellationToken::new();
        let workers = spawn_workers(d.clone(), rx, 4, cancel.clone());
        for i in 0..200 {
            queue.submit(tg("solo", &i.to_string(), &format!("o{}", i))).unwrap();
        }
        for _ in 0..500 {
            if adapter.sent.lock().unwrap().len() == 200 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        for w in workers {
            w.await.unwrap();
        }
        let expected: Vec<String> = (0..200).map(|i| i.to_string()).collect();
        assert_eq!(*backend.prompts.lock().unwrap(), expected);
        assert_eq!(backend.max_concurrent_per_session.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_timeouts_send_one_fallback() {
        let backend = Arc::new(FakeBackend {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        let (d, adapter) = setup(backend.clone()).await;
        assert_eq!(d.handle(tg("9", "slow", "x1")).await, DispatchOutcome::Processed(1));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        let sent = adapter.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("9".to_string(), "sorry, try again later".to_string())]);
        let session = d.sessions().get(&SessionKey::new(Channel::Telegram, "9")).await.unwrap();
        assert!(!session.in_flight);
    }

    #[tokio::test]
    async fn transient_errors_retry_then_fallback() {
        let backend = Arc::new(FakeBackend {
            fail_transient: true,
            ..Default::default()
        });
        let (d, adapter) = setup(backend.clone()).await;
        d.handle(tg("9", "hello", "y1")).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(adapter.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delivery_is_retried() {
        let backend = Arc::new(FakeBackend::default());
        let (d, adapter) = setup(backend).await;
        adapter.failures_left.store(2, Ordering::SeqCst);
        d.handle(tg("5", "ping", "z1")).await;
        assert_eq!(adapter.sent.lock().unwrap().len(), 1);

        adapter.failures_left.store(3, Ordering::SeqCst);
        assert!(!d.deliver(Channel::Telegram, "5", "lost").await);
        assert!(!d.deliver(Channel::Feishu, "5", "no adapter").await);
    }

    #[tokio::test]
    async fn failed_part_is_retried_alone() {
        let adapter = RecordingAdapter {
            max_chars: Some(10),
            fail_attempt: Some(2),
            ..Default::default()
        };
        let (d, adapter) = setup_with(Arc::new(FakeBackend::default()), adapter).await;
        let text = format!("{}{}", "a".repeat(10), "b".repeat(4));
        assert!(d.deliver(Channel::Telegram, "8", &text).await);
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 3);
        let parts: Vec<String> = adapter.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
        assert_eq!(parts, vec!["a".repeat(10), "b".repeat(4)]);
    }

    #[tokio::test]
    async fn new_command_resets_without_backend_call() {
        let backend = Arc::new(FakeBackend::default());
        let (d, adapter) = setup(backend.clone()).await;
        d.handle(tg("3", "hello", "n1")).await;
        let key = SessionKey::new(Channel::Telegram, "3");
        let before = d.sessions().get(&key).await.unwrap().reasoning_session_id;
        d.handle(tg("3", " /NEW ", "n2")).await;
        let after = d.sessions().get(&key).await.unwrap().reasoning_session_id;
        assert_ne!(before, after);
        assert_eq!(*backend.forgotten.lock().unwrap(), vec![before]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.sent.lock().unwrap().last().unwrap().1, NEW_SESSION_REPLY);
    }

    #[tokio::test]
    async fn notices_skip_the_backend() {
        let backend = Arc::new(FakeBackend::default());
        let (d, adapter) = setup(backend.clone()).await;
        let notice = Message::synthetic(Channel::Telegram, "admin", "backend down", Origin::Notice);
        assert_eq!(d.handle(notice).await, DispatchOutcome::Processed(1));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.sent.lock().unwrap()[0].1, "backend down");
    }
}
