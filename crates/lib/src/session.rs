//! Conversation sessions: (channel, conversation) -> reasoning session id.
//!
//! Each key has its own lock so different conversations never wait on each other.
//! The store also holds the per-key FIFO of messages that arrive while a backend call
//! for that conversation is in flight.

use crate::message::{Channel, Message};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Channel side of a session: platform plus external conversation id (e.g. Telegram chat_id).
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SessionKey {
    pub channel: Channel,
    pub conversation_id: String,
}

impl SessionKey {
    pub fn new(channel: Channel, conversation_id: impl Into<String>) -> Self {
        Self {
            channel,
            conversation_id: conversation_id.into(),
        }
    }

    pub fn of(msg: &Message) -> Self {
        Self::new(msg.channel(), msg.conversation_id())
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.conversation_id)
    }
}

/// Snapshot of a session.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub reasoning_session_id: String,
    pub last_activity_at: Instant,
    pub in_flight: bool,
}

struct SessionEntry {
    session: Session,
    pending: VecDeque<Message>,
}

impl SessionEntry {
    fn new(key: SessionKey) -> Self {
        Self {
            session: Session {
                key,
                reasoning_session_id: new_reasoning_session_id(),
                last_activity_at: Instant::now(),
                in_flight: false,
            },
            pending: VecDeque::new(),
        }
    }
}

fn new_reasoning_session_id() -> String {
    format!("sess-{}", uuid::Uuid::new_v4())
}

/// What the dispatcher should do with an admitted message.
#[derive(Debug)]
pub enum Admission {
    /// The session was idle and is now in flight; the caller processes the message and owns
    /// the session until `finish` returns None.
    Dispatch(Session, Message),
    /// A call is already in flight; the message waits at this 1-based position.
    Queued { position: usize },
}

/// In-memory session store with per-key locking.
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<SessionKey, Arc<Mutex<SessionEntry>>>>>,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            idle_ttl,
        }
    }

    /// Run `f` on the existing entry for `key` under its lock. The map guard is held until the
    /// entry lock is taken, so eviction cannot drop an entry between lookup and lock.
    async fn with_existing<R>(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&mut SessionEntry) -> R,
    ) -> Option<R> {
        let map = self.inner.read().await;
        let entry = map.get(key).cloned()?;
        let mut g = entry.lock().await;
        drop(map);
        Some(f(&mut g))
    }

    /// Like `with_existing`, creating the entry first when missing.
    async fn with_or_create<R>(&self, key: &SessionKey, f: impl FnOnce(&mut SessionEntry) -> R) -> R {
        {
            let map = self.inner.read().await;
            if let Some(entry) = map.get(key).cloned() {
                let mut g = entry.lock().await;
                drop(map);
                return f(&mut g);
            }
        }
        let mut map = self.inner.write().await;
        let entry = map
            .entry(key.clone())
            .or_insert_with(|| {
                log::debug!("session: created for {}", key);
                Arc::new(Mutex::new(SessionEntry::new(key.clone())))
            })
            .clone();
        let mut g = entry.lock().await;
        drop(map);
        f(&mut g)
    }

    /// Resolve or lazily create the session for `key`.
    pub async fn get_or_create(&self, key: &SessionKey) -> Session {
        self.with_or_create(key, |e| e.session.clone()).await
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Session> {
        self.with_existing(key, |e| e.session.clone()).await
    }

    /// Set the in-flight flag. Returns false when the session does not exist.
    pub async fn mark_in_flight(&self, key: &SessionKey, in_flight: bool) -> bool {
        self.with_existing(key, |e| e.session.in_flight = in_flight)
            .await
            .is_some()
    }

    /// Record activity now.
    pub async fn touch(&self, key: &SessionKey) -> bool {
        self.with_existing(key, |e| e.session.last_activity_at = Instant::now())
            .await
            .is_some()
    }

    /// Admit a message for its session: take the session in flight if idle, else queue it (FIFO).
    pub async fn admit(&self, msg: Message) -> Admission {
        let key = SessionKey::of(&msg);
        self.with_or_create(&key, move |e| {
            if e.session.in_flight {
                e.pending.push_back(msg);
                Admission::Queued {
                    position: e.pending.len(),
                }
            } else {
                e.session.in_flight = true;
                e.session.last_activity_at = Instant::now();
                Admission::Dispatch(e.session.clone(), msg)
            }
        })
        .await
    }

    /// Finish the current call for `key`. Returns the next queued message (session stays in flight)
    /// or None after clearing the in-flight flag.
    pub async fn finish(&self, key: &SessionKey) -> Option<Message> {
        self.with_existing(key, |e| {
            e.session.last_activity_at = Instant::now();
            match e.pending.pop_front() {
                Some(next) => Some(next),
                None => {
                    e.session.in_flight = false;
                    None
                }
            }
        })
        .await
        .flatten()
    }

    /// Current reasoning session id for `key`, creating the session if needed.
    pub async fn reasoning_session_id(&self, key: &SessionKey) -> String {
        self.get_or_create(key).await.reasoning_session_id
    }

    /// Start a fresh reasoning session for `key`; returns the new id.
    pub async fn reset(&self, key: &SessionKey) -> String {
        let id = new_reasoning_session_id();
        let set = id.clone();
        self.with_or_create(key, move |e| {
            e.session.reasoning_session_id = set;
            e.session.last_activity_at = Instant::now();
        })
        .await;
        id
    }

    /// Drop sessions idle longer than the TTL. In-flight sessions, sessions with queued
    /// messages and sessions whose lock is held are kept for a later pass.
    pub async fn evict_expired(&self, now: Instant) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        let ttl = self.idle_ttl;
        map.retain(|key, entry| {
            let Ok(g) = entry.try_lock() else {
                return true;
            };
            let idle = now.saturating_duration_since(g.session.last_activity_at);
            let keep = g.session.in_flight || !g.pending.is_empty() || idle < ttl;
            if !keep {
                log::debug!("session: evicting {} (idle {:?})", key, idle);
            }
            keep
        });
        before - map.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Origin;

    fn msg(conv: &str, text: &str) -> Message {
        Message::synthetic(Channel::Telegram, conv, text, Origin::Scheduled)
    }

    #[tokio::test]
    async fn get_or_create_is_stable() {
        let store = SessionStore::new(Duration::from_secs(60));
        let key = SessionKey::new(Channel::Feishu, "oc_1");
        let a = store.get_or_create(&key).await;
        let b = store.get_or_create(&key).await;
        assert_eq!(a.reasoning_session_id, b.reasoning_session_id);
        assert!(a.reasoning_session_id.starts_with("sess-"));
        let other = store.get_or_create(&SessionKey::new(Channel::WeCom, "oc_1")).await;
        assert_ne!(a.reasoning_session_id, other.reasoning_session_id);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn second_message_queues_in_order() {
        let store = SessionStore::new(Duration::from_secs(60));
        let key = SessionKey::new(Channel::Telegram, "1");
        assert!(matches!(store.admit(msg("1", "a")).await, Admission::Dispatch(..)));
        assert!(matches!(store.admit(msg("1", "b")).await, Admission::Queued { position: 1 }));
        assert!(matches!(store.admit(msg("1", "c")).await, Admission::Queued { position: 2 }));
        assert!(matches!(store.admit(msg("2", "x")).await, Admission::Dispatch(..)));
        assert_eq!(store.finish(&key).await.unwrap().text(), "b");
        assert!(store.get(&key).await.unwrap().in_flight);
        assert_eq!(store.finish(&key).await.unwrap().text(), "c");
        assert!(store.finish(&key).await.is_none());
        assert!(!store.get(&key).await.unwrap().in_flight);
    }

    #[tokio::test]
    async fn eviction_skips_in_flight() {
        let store = SessionStore::new(Duration::from_secs(10));
        let busy = SessionKey::new(Channel::Telegram, "busy");
        let idle = SessionKey::new(Channel::Telegram, "idle");
        store.get_or_create(&idle).await;
        assert!(matches!(store.admit(msg("busy", "a")).await, Admission::Dispatch(..)));
        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(store.evict_expired(later).await, 1);
        assert!(store.get(&idle).await.is_none());
        assert!(store.get(&busy).await.is_some());
        assert!(store.finish(&busy).await.is_none());
        assert_eq!(store.evict_expired(Instant::now() + Duration::from_secs(11)).await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn fresh_sessions_survive_eviction() {
        let store = SessionStore::new(Duration::from_secs(10));
        let key = SessionKey::new(Channel::WeCom, "u");
        store.get_or_create(&key).await;
        assert_eq!(store.evict_expired(Instant::now()).await, 0);
        assert!(store.touch(&key).await);
        assert!(store.mark_in_flight(&key, true).await);
        assert!(!store.touch(&SessionKey::new(Channel::WeCom, "nobody")).await);
    }

    #[tokio::test]
    async fn reset_replaces_reasoning_session_id() {
        let store = SessionStore::new(Duration::from_secs(60));
        let key = SessionKey::new(Channel::Telegram, "1");
        let before = store.reasoning_session_id(&key).await;
        let after = store.reset(&key).await;
        assert_ne!(before, after);
        assert_eq!(store.reasoning_session_id(&key).await, after);
    }
}
