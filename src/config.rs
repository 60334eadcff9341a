use std::time::Duration;

/// Startup policy-loading strategy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// Always load every tenant's rules.
    #[default]
    Full,
    /// Load only the default tenant's rules (plus wildcard) when a
    /// default tenant is configured.
    Filtered,
    /// Count rules first; below the threshold behave as `full`,
    /// otherwise as `filtered`.
    Adaptive,
}

/// Policy-loading configuration.
#[derive(Clone, Debug, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub strategy: LoadStrategy,
    pub adaptive_threshold: usize,
    pub default_tenant: Option<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            strategy: LoadStrategy::Full,
            adaptive_threshold: 1_000,
            default_tenant: None,
        }
    }
}

/// Decision-cache configuration.
#[derive(Clone, Debug, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Consulted by `GuardBuilder::cache_from_config`; when false, no
    /// decision cache is attached and every check reaches the engine.
    pub enabled: bool,
    /// L1 (in-process) entry lifetime in seconds.
    pub memory_ttl_secs: u64,
    /// L2 (shared) entry lifetime in seconds; normally longer than L1's.
    pub shared_ttl_secs: u64,
    /// Maximum number of L1 entries.
    pub max_size: usize,
}

impl CacheConfig {
    /// L1 TTL as a [`Duration`].
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    /// L2 TTL as a [`Duration`].
    pub fn shared_ttl(&self) -> Duration {
        Duration::from_secs(self.shared_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_ttl_secs: 60,
            shared_ttl_secs: 300,
            max_size: 10_000,
        }
    }
}

/// Audit-trail configuration.
#[derive(Clone, Debug, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Record decision checks in addition to mutations.
    pub log_decisions: bool,
    /// Fraction of allow decisions recorded, in `[0, 1]`. Deny decisions
    /// and mutations are never sampled out.
    pub sample_rate: f64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_decisions: true,
            sample_rate: 1.0,
        }
    }
}

/// Top-level configuration surface.
#[derive(Clone, Debug, Default, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub cache: CacheConfig,
    pub audit: AuditConfig,
    pub load: LoadConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_should_deserialize_with_defaults() {
        let config: GuardConfig = serde_json::from_str(
            r#"{"load": {"strategy": "adaptive", "default_tenant": "acme"}}"#,
        )
        .unwrap();

        assert_eq!(config.load.strategy, LoadStrategy::Adaptive);
        assert_eq!(config.load.adaptive_threshold, 1_000);
        assert_eq!(config.load.default_tenant.as_deref(), Some("acme"));
        assert!(config.cache.enabled);
        assert_eq!(config.cache.shared_ttl_secs, 300);
        assert_eq!(config.audit.sample_rate, 1.0);
    }
}
