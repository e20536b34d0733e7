//! Recently-seen idempotency keys, bounded by a time window and a key count.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub struct RecentlySeen {
    window: Duration,
    capacity: usize,
    seen: HashMap<String, Instant>,
    /// Insertion order, oldest first. May hold keys already dropped from `seen`.
    order: VecDeque<(String, Instant)>,
}

impl RecentlySeen {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `key` at `now`. Returns false when the key was already seen inside the window.
    pub fn check_and_insert(&mut self, key: &str, now: Instant) -> bool {
        self.expire(now);
        if let Some(at) = self.seen.get(key) {
            if now.saturating_duration_since(*at) < self.window {
                return false;
            }
        }
        while self.seen.len() >= self.capacity {
            let Some((old, at)) = self.order.pop_front() else {
                break;
            };
            if self.seen.get(&old) == Some(&at) {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(key.to_string(), now);
        self.order.push_back((key.to_string(), now));
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((key, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            if self.seen.get(key) == Some(at) {
                self.seen.remove(key);
            }
            self.order.pop_front();
        }
    }
}
