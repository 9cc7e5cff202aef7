//! Per-community serialization.
//!
//! Scheduling decisions (cancel-then-arm) and claim adjudication
//! (read-check-write of the fetched set and balances) both run under the
//! community's lock; a single registry instance is shared so they serialize
//! against each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct CommunityLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl CommunityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, community_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(community_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn same_community_excludes() {
        let locks = CommunityLocks::new();
        let guard = locks.acquire("c1").await;
        assert!(timeout(Duration::from_millis(50), locks.acquire("c1")).await.is_err());
        drop(guard);
        assert!(timeout(Duration::from_millis(50), locks.acquire("c1")).await.is_ok());
    }

    #[tokio::test]
    async fn different_communities_do_not_block() {
        let locks = CommunityLocks::new();
        let _one = locks.acquire("c1").await;
        assert!(timeout(Duration::from_millis(50), locks.acquire("c2")).await.is_ok());
    }
}
