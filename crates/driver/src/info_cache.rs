use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::ServerInfo;

/// Per-server version and session-user info, refreshed after `ttl`.
#[derive(Clone)]
pub(crate) struct ServerInfoCache {
    cache: Arc<RwLock<HashMap<i64, CachedServerInfo>>>,
    ttl: Duration,
}

#[derive(Clone)]
struct CachedServerInfo {
    info: ServerInfo,
    expires_at: Instant,
}

impl ServerInfoCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.ttl > Duration::ZERO
    }

    pub(crate) async fn get(&self, server_id: i64) -> Option<ServerInfo> {
        if !self.enabled() {
            return None;
        }

        let now = Instant::now();
        let cache = self.cache.read().await;
        cache
            .get(&server_id)
            .and_then(|entry| (entry.expires_at > now).then(|| entry.info.clone()))
    }

    pub(crate) async fn put(&self, server_id: i64, info: ServerInfo) {
        if !self.enabled() {
            return;
        }

        let expires_at = Instant::now() + self.ttl;
        let mut cache = self.cache.write().await;
        cache.insert(server_id, CachedServerInfo { info, expires_at });
    }

    pub(crate) async fn invalidate(&self, server_id: i64) {
        self.cache.write().await.remove(&server_id);
    }
}
