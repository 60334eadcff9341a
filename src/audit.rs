use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::StoreError;

const QUEUE_DEPTH: usize = 1_024;
const SAMPLE_BUCKETS: u64 = 10_000;

/// Decision reasons recorded on audit records.
pub mod reason {
    pub const PLATFORM_ADMIN: &str = "platform_admin";
    pub const CACHE_HIT: &str = "cache_hit";
    pub const ENFORCER_CHECK: &str = "enforcer_check";
    pub const PERMISSION_DENIED: &str = "permission_denied";
}

/// Kind of actor that caused an audited event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Service,
    System,
}

/// Append-only record of a decision or a policy mutation.
///
/// Never mutated after creation; purge is a separate retention operation.
#[derive(Clone, Debug, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct AuditRecord {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub actor_type: ActorType,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub subject_id: Option<String>,
    pub tenant_id: String,
    pub decision: Option<bool>,
    pub decision_reason: Option<String>,
    pub policy_before: Option<serde_json::Value>,
    pub policy_after: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub latency_ms: Option<u64>,
}

impl AuditRecord {
    fn base(actor_id: &str, actor_type: ActorType, action: &str, tenant_id: &str) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor_id: actor_id.to_string(),
            actor_type,
            action: action.to_string(),
            resource_type: None,
            resource_id: None,
            subject_id: None,
            tenant_id: tenant_id.to_string(),
            decision: None,
            decision_reason: None,
            policy_before: None,
            policy_after: None,
            reason: None,
            latency_ms: None,
        }
    }

    /// Creates a permission-check record.
    pub fn decision(
        actor_id: &str,
        tenant_id: &str,
        resource: &str,
        action: &str,
        allowed: bool,
        decision_reason: &str,
        latency_ms: u64,
    ) -> Self {
        let mut record = Self::base(actor_id, ActorType::User, "permission_check", tenant_id);
        record.resource_type = Some(resource.to_string());
        record.resource_id = Some(format!("{resource}:{action}"));
        record.subject_id = Some(actor_id.to_string());
        record.decision = Some(allowed);
        record.decision_reason = Some(decision_reason.to_string());
        record.latency_ms = Some(latency_ms);
        record
    }

    /// Creates a policy/role mutation record.
    pub fn mutation(actor_id: &str, action: &str, tenant_id: &str) -> Self {
        Self::base(actor_id, ActorType::User, action, tenant_id)
    }

    /// Sets the affected subject.
    pub fn with_subject(mut self, subject_id: &str) -> Self {
        self.subject_id = Some(subject_id.to_string());
        self
    }

    /// Sets the policy state after the mutation.
    pub fn with_policy_after(mut self, policy: serde_json::Value) -> Self {
        self.policy_after = Some(policy);
        self
    }

    /// Sets the policy state before the mutation.
    pub fn with_policy_before(mut self, policy: serde_json::Value) -> Self {
        self.policy_before = Some(policy);
        self
    }
}

/// Filter set for audit queries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuditQuery {
    pub tenant_id: Option<String>,
    pub actor_id: Option<String>,
    pub subject_id: Option<String>,
    pub action: Option<String>,
    pub decision: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, record: &AuditRecord) -> bool {
        self.tenant_id
            .as_deref()
            .is_none_or(|tenant| record.tenant_id == tenant)
            && self
                .actor_id
                .as_deref()
                .is_none_or(|actor| record.actor_id == actor)
            && self
                .subject_id
                .as_deref()
                .is_none_or(|subject| record.subject_id.as_deref() == Some(subject))
            && self
                .action
                .as_deref()
                .is_none_or(|action| record.action == action)
            && self
                .decision
                .is_none_or(|decision| record.decision == Some(decision))
            && self.from.is_none_or(|from| record.timestamp >= from)
            && self.to.is_none_or(|to| record.timestamp < to)
    }
}

/// Append-only audit sink boundary.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Appends one record.
    async fn append(&self, record: AuditRecord) -> std::result::Result<(), StoreError>;

    /// Returns records matching the filter, paginated.
    async fn query(&self, query: AuditQuery)
    -> std::result::Result<Vec<AuditRecord>, StoreError>;

    /// Deletes records older than `cutoff`. Returns the count removed.
    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> std::result::Result<usize, StoreError>;
}

/// In-memory audit sink for tests and single-node deployments.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every record, for tests.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("poisoned lock").clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> std::result::Result<(), StoreError> {
        self.records.lock().expect("poisoned lock").push(record);
        Ok(())
    }

    async fn query(
        &self,
        query: AuditQuery,
    ) -> std::result::Result<Vec<AuditRecord>, StoreError> {
        let guard = self.records.lock().expect("poisoned lock");
        let matching = guard
            .iter()
            .filter(|record| query.matches(record))
            .skip(query.offset);
        Ok(match query.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        })
    }

    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> std::result::Result<usize, StoreError> {
        let mut guard = self.records.lock().expect("poisoned lock");
        let before = guard.len();
        guard.retain(|record| record.timestamp >= cutoff);
        Ok(before - guard.len())
    }
}

/// Serializes records as a JSON array.
pub fn export_json(records: &[AuditRecord]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(records)
}

/// Serializes records as CSV with a header row.
pub fn export_csv(records: &[AuditRecord]) -> String {
    let mut out = String::from(
        "event_id,timestamp,actor_id,actor_type,action,resource_type,resource_id,subject_id,tenant_id,decision,decision_reason,reason,latency_ms\n",
    );
    for record in records {
        let fields = [
            record.event_id.clone(),
            record.timestamp.to_rfc3339(),
            record.actor_id.clone(),
            format!("{:?}", record.actor_type).to_ascii_lowercase(),
            record.action.clone(),
            record.resource_type.clone().unwrap_or_default(),
            record.resource_id.clone().unwrap_or_default(),
            record.subject_id.clone().unwrap_or_default(),
            record.tenant_id.clone(),
            record
                .decision
                .map(|decision| decision.to_string())
                .unwrap_or_default(),
            record.decision_reason.clone().unwrap_or_default(),
            record.reason.clone().unwrap_or_default(),
            record
                .latency_ms
                .map(|latency| latency.to_string())
                .unwrap_or_default(),
        ];
        let row: Vec<String> = fields.iter().map(|field| csv_escape(field)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Asynchronous, best-effort audit writer.
///
/// Records are queued onto a bounded channel and written by one
/// background task; the request path never awaits the write. A full
/// queue drops the record with a warning, and `shutdown` drains what
/// was queued before returning.
pub struct AuditTrail {
    config: AuditConfig,
    inner: Mutex<Option<TrailInner>>,
}

struct TrailInner {
    tx: mpsc::Sender<AuditRecord>,
    handle: JoinHandle<()>,
}

impl AuditTrail {
    /// Spawns the background writer and returns the trail handle.
    pub fn start(sink: Arc<dyn AuditSink>, config: AuditConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(QUEUE_DEPTH);
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(error) = sink.append(record).await {
                    warn!(%error, "audit append failed");
                }
            }
        });
        Self {
            config,
            inner: Mutex::new(Some(TrailInner { tx, handle })),
        }
    }

    /// Queues a record without blocking. Applies sampling to allow
    /// decisions; deny decisions and mutations are never sampled out.
    pub fn record(&self, record: AuditRecord) {
        if !self.should_record(&record) {
            return;
        }
        let tx = {
            let guard = self.inner.lock().expect("poisoned lock");
            match guard.as_ref() {
                Some(inner) => inner.tx.clone(),
                None => {
                    debug!("audit trail already shut down; dropping record");
                    return;
                }
            }
        };
        if let Err(error) = tx.try_send(record) {
            warn!(%error, "audit queue full; dropping record");
        }
    }

    /// Stops accepting records and waits for the queued backlog to be
    /// written.
    pub async fn shutdown(&self) {
        let inner = self.inner.lock().expect("poisoned lock").take();
        if let Some(TrailInner { tx, handle }) = inner {
            drop(tx);
            if let Err(error) = handle.await {
                warn!(%error, "audit writer task failed");
            }
        }
    }

    fn should_record(&self, record: &AuditRecord) -> bool {
        if !self.config.enabled {
            return false;
        }
        match record.decision {
            None => true,
            Some(_) if !self.config.log_decisions => false,
            Some(false) => true,
            Some(true) => sample_bucket(&record.actor_id) < self.config.sample_rate,
        }
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Deterministic sampling bucket in `[0, 1)` for an actor id.
fn sample_bucket(actor_id: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    actor_id.hash(&mut hasher);
    (hasher.finish() % SAMPLE_BUCKETS) as f64 / SAMPLE_BUCKETS as f64
}
