use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lru::LruCache;
use tracing::warn;

use crate::error::{Error, Result, StoreError};
use crate::types::{ActionName, ResourceName, SubjectId, TenantId};

const KEY_PREFIX: &str = "rbac:decision";

/// Builds the deterministic decision cache key.
pub fn decision_key(
    tenant: &TenantId,
    subject: &SubjectId,
    resource: &ResourceName,
    action: &ActionName,
) -> String {
    format!("{KEY_PREFIX}:{tenant}:{subject}:{resource}:{action}")
}

/// Builds the pattern covering every decision cached for a tenant.
pub fn tenant_pattern(tenant: &TenantId) -> String {
    format!("{KEY_PREFIX}:{tenant}:*")
}

/// Builds the pattern covering every cached decision, across tenants.
pub fn all_decisions_pattern() -> String {
    format!("{KEY_PREFIX}:*")
}

/// Builds the pattern covering a subject's decisions within a tenant.
pub fn subject_pattern(tenant: &TenantId, subject: &SubjectId) -> String {
    format!("{KEY_PREFIX}:{tenant}:{subject}:*")
}

/// Serialized decision value stored on the shared tier.
#[derive(Clone, Debug, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CachedDecision {
    pub allowed: bool,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Shared (L2) cache boundary: keyed bytes with TTL and prefix deletion.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Gets a raw value.
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError>;

    /// Sets a raw value with a TTL.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> std::result::Result<(), StoreError>;

    /// Deletes one key.
    async fn delete(&self, key: &str) -> std::result::Result<(), StoreError>;

    /// Deletes every key starting with `prefix`. Returns the count removed.
    async fn delete_prefix(&self, prefix: &str) -> std::result::Result<usize, StoreError>;
}

/// No-op shared cache for single-tier deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSharedCache;

#[async_trait]
impl SharedCache for NoSharedCache {
    async fn get(&self, _key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Duration,
    ) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    async fn delete_prefix(&self, _prefix: &str) -> std::result::Result<usize, StoreError> {
        Ok(0)
    }
}

/// Per-tier hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
}

impl CacheStats {
    /// Combined hit ratio in `[0, 1]`.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits;
        let total = hits + self.l2_misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct L1Entry {
    allowed: bool,
    expires_at: Instant,
}

/// Two-tier decision cache: a process-local LRU in front of a shared tier.
///
/// Lookups go L1 then L2; an L2 hit backfills L1. Values on the shared
/// tier are gzip-compressed serialized [`CachedDecision`]s. Reads and
/// writes absorb shared-tier failures; deletions propagate them so the
/// invalidation consumer can signal redelivery.
pub struct TieredCache {
    l1: Mutex<LruCache<String, L1Entry>>,
    l2: Box<dyn SharedCache>,
    memory_ttl: Duration,
    shared_ttl: Duration,
    counters: Counters,
}

impl TieredCache {
    /// Creates a cache with the given L1 capacity and per-tier TTLs.
    pub fn new(
        max_size: usize,
        memory_ttl: Duration,
        shared_ttl: Duration,
        shared: impl SharedCache + 'static,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            l1: Mutex::new(LruCache::new(capacity)),
            l2: Box::new(shared),
            memory_ttl,
            shared_ttl,
            counters: Counters::default(),
        }
    }

    /// Creates a cache sized and timed per configuration.
    pub fn from_config(
        config: &crate::config::CacheConfig,
        shared: impl SharedCache + 'static,
    ) -> Self {
        Self::new(
            config.max_size,
            config.memory_ttl(),
            config.shared_ttl(),
            shared,
        )
    }

    /// Looks up a cached decision. Shared-tier failures count as misses.
    pub async fn get(&self, key: &str) -> Option<bool> {
        let now = Instant::now();
        {
            let mut guard = self.l1.lock().expect("poisoned lock");
            match guard.get(key) {
                Some(entry) if entry.expires_at > now => {
                    self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.allowed);
                }
                Some(_) => {
                    guard.pop(key);
                }
                None => {}
            }
        }
        self.counters.l1_misses.fetch_add(1, Ordering::Relaxed);

        let bytes = match self.l2.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(error) => {
                warn!(key, %error, "shared cache read failed; treating as miss");
                self.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let decision = match decode_decision(&bytes) {
            Ok(decision) => decision,
            Err(error) => {
                warn!(key, %error, "undecodable shared cache value; treating as miss");
                self.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let wall_now = Utc::now();
        if decision.expires_at <= wall_now {
            self.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);

        // Backfill L1, capped by the shared entry's remaining lifetime.
        let remaining = (decision.expires_at - wall_now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.memory_ttl);
        let mut guard = self.l1.lock().expect("poisoned lock");
        guard.put(
            key.to_string(),
            L1Entry {
                allowed: decision.allowed,
                expires_at: now + remaining,
            },
        );
        Some(decision.allowed)
    }

    /// Stores a decision on both tiers. Shared-tier failures are absorbed.
    pub async fn set(&self, key: &str, allowed: bool) {
        {
            let mut guard = self.l1.lock().expect("poisoned lock");
            guard.put(
                key.to_string(),
                L1Entry {
                    allowed,
                    expires_at: Instant::now() + self.memory_ttl,
                },
            );
        }

        let now = Utc::now();
        let decision = CachedDecision {
            allowed,
            cached_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.shared_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        };
        match encode_decision(&decision) {
            Ok(bytes) => {
                if let Err(error) = self.l2.set(key, bytes, self.shared_ttl).await {
                    warn!(key, %error, "shared cache write failed");
                }
            }
            Err(error) => warn!(key, %error, "decision encoding failed"),
        }
    }

    /// Removes one key from both tiers.
    pub async fn delete(&self, key: &str) -> Result<()> {
        {
            let mut guard = self.l1.lock().expect("poisoned lock");
            guard.pop(key);
        }
        self.l2.delete(key).await.map_err(Error::Store)
    }

    /// Removes every key matching a `prefix:*` pattern.
    ///
    /// The shared tier supports real prefix deletion. L1 has no efficient
    /// pattern deletion, so any pattern delete clears the entire L1 tier.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        {
            let mut guard = self.l1.lock().expect("poisoned lock");
            guard.clear();
        }
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        self.l2.delete_prefix(prefix).await.map_err(Error::Store)
    }

    /// Returns per-tier hit and miss counts.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l1_misses: self.counters.l1_misses.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.counters.l2_misses.load(Ordering::Relaxed),
        }
    }

    /// Returns the combined hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        self.stats().hit_ratio()
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("memory_ttl", &self.memory_ttl)
            .field("shared_ttl", &self.shared_ttl)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn encode_decision(decision: &CachedDecision) -> std::io::Result<Vec<u8>> {
    let json = serde_json::to_vec(decision)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()
}

fn decode_decision(bytes: &[u8]) -> std::io::Result<CachedDecision> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_cache::MemorySharedCache;

    fn key(tenant: &str, subject: &str) -> String {
        decision_key(
            &TenantId::try_from(tenant).unwrap(),
            &SubjectId::try_from(subject).unwrap(),
            &ResourceName::try_from("document").unwrap(),
            &ActionName::try_from("edit").unwrap(),
        )
    }

    fn cache() -> TieredCache {
        TieredCache::new(
            64,
            Duration::from_secs(30),
            Duration::from_secs(300),
            MemorySharedCache::new(),
        )
    }

    #[test]
    fn decision_key_is_deterministic() {
        assert_eq!(key("acme", "user:7"), "rbac:decision:acme:user:7:document:edit");
        assert!(key("acme", "user:7").starts_with(
            subject_pattern(
                &TenantId::try_from("acme").unwrap(),
                &SubjectId::try_from("user:7").unwrap(),
            )
            .strip_suffix('*')
            .unwrap()
        ));
    }

    #[test]
    fn round_trip_compresses_and_restores() {
        let decision = CachedDecision {
            allowed: true,
            cached_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        };
        let bytes = encode_decision(&decision).unwrap();
        assert_eq!(decode_decision(&bytes).unwrap(), decision);
    }

    #[tokio::test]
    async fn get_records_tier_hits() {
        let cache = cache();
        let key = key("acme", "user:7");

        assert_eq!(cache.get(&key).await, None);
        cache.set(&key, true).await;
        assert_eq!(cache.get(&key).await, Some(true));

        let stats = cache.stats();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.l1_misses, 1);
        assert_eq!(stats.l2_misses, 1);
    }

    #[tokio::test]
    async fn l2_hit_backfills_l1() {
        let cache = cache();
        let key = key("acme", "user:7");
        cache.set(&key, false).await;
        {
            let mut guard = cache.l1.lock().unwrap();
            guard.clear();
        }

        assert_eq!(cache.get(&key).await, Some(false));
        assert_eq!(cache.stats().l2_hits, 1);
        // Second read is served from the backfilled L1.
        assert_eq!(cache.get(&key).await, Some(false));
        assert_eq!(cache.stats().l1_hits, 1);
    }

    #[tokio::test]
    async fn pattern_delete_clears_all_of_l1_but_scopes_l2() {
        let cache = cache();
        let acme = key("acme", "user:7");
        let other = key("other", "user:9");
        cache.set(&acme, true).await;
        cache.set(&other, true).await;

        let tenant = TenantId::try_from("acme").unwrap();
        cache.delete_pattern(&tenant_pattern(&tenant)).await.unwrap();

        // L1 was fully cleared, so the other tenant's entry now comes from L2.
        assert_eq!(cache.l1.lock().unwrap().len(), 0);
        assert_eq!(cache.get(&acme).await, None);
        assert_eq!(cache.get(&other).await, Some(true));
    }

    #[tokio::test]
    async fn expired_l1_entry_is_not_served() {
        let cache = TieredCache::new(
            8,
            Duration::ZERO,
            Duration::from_secs(300),
            NoSharedCache,
        );
        let key = key("acme", "user:7");
        cache.set(&key, true).await;
        assert_eq!(cache.get(&key).await, None);
    }

    #[derive(Debug, Default, Clone, Copy)]
    struct UnreachableSharedCache;

    #[async_trait]
    impl SharedCache for UnreachableSharedCache {
        async fn get(&self, _key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            Err("shared cache unreachable".into())
        }

        async fn set(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Duration,
        ) -> std::result::Result<(), StoreError> {
            Err("shared cache unreachable".into())
        }

        async fn delete(&self, _key: &str) -> std::result::Result<(), StoreError> {
            Err("shared cache unreachable".into())
        }

        async fn delete_prefix(&self, _prefix: &str) -> std::result::Result<usize, StoreError> {
            Err("shared cache unreachable".into())
        }
    }

    #[tokio::test]
    async fn shared_tier_failure_reads_as_miss_and_writes_are_absorbed() {
        // A zero L1 TTL forces every read down to the broken shared tier.
        let cache = TieredCache::new(
            8,
            Duration::ZERO,
            Duration::from_secs(300),
            UnreachableSharedCache,
        );
        let key = key("acme", "user:7");

        cache.set(&key, true).await;
        assert_eq!(cache.get(&key).await, None);
        assert_eq!(cache.stats().l2_misses, 1);

        // Deletion failures propagate so the invalidation consumer can
        // signal redelivery.
        assert!(cache.delete(&key).await.is_err());
        assert!(cache.delete_pattern("rbac:decision:acme:*").await.is_err());
    }

    #[test]
    fn hit_ratio_follows_combined_formula() {
        let stats = CacheStats {
            l1_hits: 3,
            l1_misses: 7,
            l2_hits: 1,
            l2_misses: 4,
        };
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    }
}
