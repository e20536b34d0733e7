//! Channel registry: register and lookup adapters by channel.

use super::ChannelAdapter;
use crate::message::Channel;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of enabled channel adapters. Shared across gateway.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<Channel, Arc<dyn ChannelAdapter>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register an adapter; a previous adapter for the same channel is stopped.
    pub async fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(adapter.channel(), adapter) {
            old.stop();
        }
    }

    pub async fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        let g = self.inner.read().await;
        g.get(&channel).cloned()
    }

    pub async fn channels(&self) -> Vec<Channel> {
        let g = self.inner.read().await;
        let mut ids: Vec<Channel> = g.keys().copied().collect();
        ids.sort_by_key(|c| c.as_str());
        ids
    }

    pub async fn adapters(&self) -> Vec<Arc<dyn ChannelAdapter>> {
        let g = self.inner.read().await;
        g.values().cloned().collect()
    }

    /// Stop every adapter's background connector.
    pub async fn stop_all(&self) {
        let g = self.inner.read().await;
        for adapter in g.values() {
            adapter.stop();
        }
    }
}
