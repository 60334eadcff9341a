use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cache::SharedCache;
use crate::error::StoreError;

/// In-process stand-in for the shared (L2) cache boundary.
///
/// Supports TTL expiry and prefix scans. Intended for tests and
/// single-node deployments where no distributed cache is available.
#[derive(Debug, Default, Clone)]
pub struct MemorySharedCache {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl MemorySharedCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.inner.lock().expect("poisoned lock");
        guard.values().filter(|entry| entry.expires_at > now).count()
    }

    /// Returns whether the cache holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");
        match guard.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                guard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        guard.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        guard.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> std::result::Result<usize, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        let before = guard.len();
        guard.retain(|key, _| !key.starts_with(prefix));
        Ok(before - guard.len())
    }
}
