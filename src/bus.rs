use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{TieredCache, all_decisions_pattern, subject_pattern, tenant_pattern};
use crate::error::StoreError;
use crate::types::{SubjectId, TenantId};

/// Mutation kind carried by an invalidation event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    PolicyAdded,
    PolicyRemoved,
    RoleAssigned,
    RoleRevoked,
    PermissionGranted,
    PermissionRevoked,
    /// Unrecognized action; logged and ignored by consumers.
    #[serde(other)]
    Unknown,
}

impl EventAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::PolicyAdded => "policy_added",
            Self::PolicyRemoved => "policy_removed",
            Self::RoleAssigned => "role_assigned",
            Self::RoleRevoked => "role_revoked",
            Self::PermissionGranted => "permission_granted",
            Self::PermissionRevoked => "permission_revoked",
            Self::Unknown => "unknown",
        }
    }
}

/// Optional event payload narrowing the invalidation scope.
#[derive(Clone, Debug, Default, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EventDetails {
    pub role: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    /// Exact cache keys to delete instead of a scoped pattern.
    pub cache_keys: Option<Vec<String>>,
    pub reload_policy: Option<bool>,
}

/// Mutation event published on the invalidation bus and consumed by
/// every engine instance's cache layer.
#[derive(Clone, Debug, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct InvalidationEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: EventAction,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub details: EventDetails,
}

impl InvalidationEvent {
    /// Creates an event with a generated id and timestamp.
    pub fn new(action: EventAction, tenant: &TenantId) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action,
            tenant_id: tenant.as_str().to_string(),
            subject_id: None,
            details: EventDetails::default(),
        }
    }

    /// Scopes the event to one subject.
    pub fn with_subject(mut self, subject: &SubjectId) -> Self {
        self.subject_id = Some(subject.as_str().to_string());
        self
    }

    /// Attaches explicit cache keys to delete.
    pub fn with_cache_keys(mut self, keys: Vec<String>) -> Self {
        self.details.cache_keys = Some(keys);
        self
    }

    /// Routing key derived from `(action, tenant)`.
    pub fn routing_key(&self) -> String {
        format!("authz.{}.{}", self.action.as_str(), self.tenant_id)
    }
}

/// Publisher side of the invalidation bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one event.
    async fn publish(&self, event: &InvalidationEvent) -> std::result::Result<(), StoreError>;
}

/// Publisher that discards events, for deployments without a bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _event: &InvalidationEvent) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}

/// In-process bus transport backed by a bounded channel.
///
/// Stands in for the broker boundary: the publish/consume contract is
/// identical, only the transport differs.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    tx: mpsc::Sender<Vec<u8>>,
}

impl MemoryBus {
    /// Creates a bus and the receiver half consumed by one engine instance.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Returns a sender usable for redelivery.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryBus {
    async fn publish(&self, event: &InvalidationEvent) -> std::result::Result<(), StoreError> {
        let body = serde_json::to_vec(event)?;
        debug!(routing_key = %event.routing_key(), "publishing invalidation event");
        self.tx.send(body).await?;
        Ok(())
    }
}

/// Pattern covering every decision within a tenant scope.
///
/// A literal `*` tenant segment would match nothing as a shared-tier
/// prefix, so the wildcard scope widens to the full decision space.
fn tenant_scope_pattern(tenant: &TenantId) -> String {
    if tenant.is_wildcard() {
        all_decisions_pattern()
    } else {
        tenant_pattern(tenant)
    }
}

/// How a consumed message is settled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Processed; acknowledge.
    Ack,
    /// Transient failure; signal for redelivery so a later retry can
    /// still converge the cache.
    Requeue,
    /// Permanent failure (malformed body); acknowledge without requeue.
    Drop,
}

/// Consumer worker pruning the decision cache from invalidation events.
///
/// Cache-clearing operations are idempotent and commutative, so
/// duplicate or out-of-order delivery is safe.
pub struct InvalidationConsumer {
    cache: Arc<TieredCache>,
    max_in_flight: usize,
}

impl InvalidationConsumer {
    /// Creates a consumer pruning `cache`.
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self {
            cache,
            max_in_flight: 8,
        }
    }

    /// Bounds the worker pool for concurrent handlers.
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit.max(1);
        self
    }

    /// Consumes messages until shutdown or channel close, then waits for
    /// in-flight handlers to finish before returning.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Vec<u8>>,
        requeue: mpsc::Sender<Vec<u8>>,
        shutdown: CancellationToken,
    ) {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        loop {
            while in_flight.len() >= self.max_in_flight {
                in_flight.join_next().await;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => {
                    let Some(body) = received else { break };
                    let consumer = Arc::clone(&self);
                    let requeue = requeue.clone();
                    in_flight.spawn(async move {
                        if consumer.handle(&body).await == Disposition::Requeue
                            && let Err(error) = requeue.send(body).await
                        {
                            warn!(%error, "redelivery failed; cache converges only at entry expiry");
                        }
                    });
                }
            }
        }
        while in_flight.join_next().await.is_some() {}
    }

    /// Handles one raw message body.
    pub async fn handle(&self, body: &[u8]) -> Disposition {
        let event: InvalidationEvent = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "malformed invalidation event; dropping");
                return Disposition::Drop;
            }
        };
        self.apply(&event).await
    }

    /// Applies one decoded event to the cache.
    pub async fn apply(&self, event: &InvalidationEvent) -> Disposition {
        let tenant = TenantId::from_string(event.tenant_id.clone());
        let outcome = match event.action {
            EventAction::PolicyAdded | EventAction::PolicyRemoved => {
                // Policy changes can affect any subject holding the role.
                self.cache
                    .delete_pattern(&tenant_scope_pattern(&tenant))
                    .await
                    .map(|_| ())
            }
            EventAction::RoleAssigned | EventAction::RoleRevoked => {
                self.invalidate_subject_scope(event, &tenant).await
            }
            EventAction::PermissionGranted | EventAction::PermissionRevoked => {
                match event.details.cache_keys.as_deref() {
                    Some(keys) if !keys.is_empty() => self.delete_keys(keys).await,
                    _ => self.invalidate_subject_scope(event, &tenant).await,
                }
            }
            EventAction::Unknown => {
                debug!(event_id = %event.event_id, "ignoring unknown invalidation action");
                Ok(())
            }
        };

        match outcome {
            Ok(()) => Disposition::Ack,
            Err(error) => {
                warn!(event_id = %event.event_id, %error, "cache invalidation failed; requeueing");
                Disposition::Requeue
            }
        }
    }

    async fn invalidate_subject_scope(
        &self,
        event: &InvalidationEvent,
        tenant: &TenantId,
    ) -> crate::error::Result<()> {
        let pattern = match &event.subject_id {
            Some(subject) if !tenant.is_wildcard() => {
                subject_pattern(tenant, &SubjectId::from_string(subject.clone()))
            }
            _ => tenant_scope_pattern(tenant),
        };
        self.cache.delete_pattern(&pattern).await.map(|_| ())
    }

    async fn delete_keys(&self, keys: &[String]) -> crate::error::Result<()> {
        for key in keys {
            self.cache.delete(key).await?;
        }
        Ok(())
    }
}
