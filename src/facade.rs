use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::warn;

use crate::audit::{AuditRecord, AuditTrail, reason};
use crate::bus::{EventAction, EventPublisher, InvalidationEvent, NoopPublisher};
use crate::cache::{
    SharedCache, TieredCache, all_decisions_pattern, decision_key, subject_pattern, tenant_pattern,
};
use crate::config::CacheConfig;
use crate::engine::Enforcer;
use crate::error::{Error, Result};
use crate::store::{AssignmentStore, PlatformOverride, PlatformStore, RoleAssignment};
use crate::types::{ActionName, ResourceName, RoleId, TenantId, UserId};

/// Enforcement facade combining the platform-override tier, the decision
/// cache, the policy engine, role-assignment records, the audit trail,
/// and the invalidation bus behind one call surface.
///
/// Decision order is fixed: platform override, then cache, then engine
/// with cache write-back, then an asynchronous audit record. Store and
/// engine failures propagate so callers fail closed; cache and audit
/// failures never affect the decision.
pub struct Guard {
    enforcer: Arc<Enforcer>,
    platform: Arc<dyn PlatformStore>,
    assignments: Arc<dyn AssignmentStore>,
    cache: Option<Arc<TieredCache>>,
    audit: Option<Arc<AuditTrail>>,
    publisher: Arc<dyn EventPublisher>,
}

/// Builder for [`Guard`].
pub struct GuardBuilder {
    enforcer: Arc<Enforcer>,
    platform: Arc<dyn PlatformStore>,
    assignments: Arc<dyn AssignmentStore>,
    cache: Option<Arc<TieredCache>>,
    audit: Option<Arc<AuditTrail>>,
    publisher: Arc<dyn EventPublisher>,
}

impl GuardBuilder {
    /// Creates a builder without cache, audit trail, or bus.
    pub fn new(
        enforcer: Arc<Enforcer>,
        platform: Arc<dyn PlatformStore>,
        assignments: Arc<dyn AssignmentStore>,
    ) -> Self {
        Self {
            enforcer,
            platform,
            assignments,
            cache: None,
            audit: None,
            publisher: Arc::new(NoopPublisher),
        }
    }

    /// Attaches the decision cache.
    pub fn cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attaches a decision cache built from configuration. A disabled
    /// cache config attaches nothing, leaving the engine as the only
    /// decision source.
    pub fn cache_from_config(
        self,
        config: &CacheConfig,
        shared: impl SharedCache + 'static,
    ) -> Self {
        if !config.enabled {
            return self;
        }
        self.cache(Arc::new(TieredCache::from_config(config, shared)))
    }

    /// Attaches the audit trail.
    pub fn audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Attaches the invalidation-event publisher.
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Builds the facade.
    pub fn build(self) -> Guard {
        Guard {
            enforcer: self.enforcer,
            platform: self.platform,
            assignments: self.assignments,
            cache: self.cache,
            audit: self.audit,
            publisher: self.publisher,
        }
    }
}

impl Guard {
    /// Checks whether `user` may perform `action` on `resource` within
    /// `tenant`.
    ///
    /// An active platform override answers allow before the cache or the
    /// engine are consulted, so overrides take effect and expire without
    /// waiting out cache TTLs.
    pub async fn check_permission(
        &self,
        user: &UserId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
    ) -> Result<bool> {
        let start = Instant::now();
        if self.has_active_override(user).await? {
            self.audit_decision(user, tenant, resource, action, true, reason::PLATFORM_ADMIN, start);
            return Ok(true);
        }

        let (allowed, decision_reason) = self.evaluate(user, tenant, resource, action).await?;
        self.audit_decision(user, tenant, resource, action, allowed, decision_reason, start);
        Ok(allowed)
    }

    /// Checks several `(resource, action)` pairs in one call, keyed by
    /// `resource:action` in the result map.
    ///
    /// The platform tier is consulted once for the whole batch; each pair
    /// then goes through the cache and engine independently.
    pub async fn check_batch(
        &self,
        user: &UserId,
        tenant: &TenantId,
        pairs: &[(ResourceName, ActionName)],
    ) -> Result<HashMap<String, bool>> {
        let mut results = HashMap::with_capacity(pairs.len());
        let overridden = self.has_active_override(user).await?;

        for (resource, action) in pairs {
            let start = Instant::now();
            let (allowed, decision_reason) = if overridden {
                (true, reason::PLATFORM_ADMIN)
            } else {
                self.evaluate(user, tenant, resource, action).await?
            };
            self.audit_decision(user, tenant, resource, action, allowed, decision_reason, start);
            results.insert(format!("{resource}:{action}"), allowed);
        }
        Ok(results)
    }

    /// Returns the `resource.action` permission strings `user` holds
    /// within `tenant`, deduplicated and sorted.
    ///
    /// A user with an active platform override holds everything, reported
    /// as the single entry `"*"`.
    pub async fn get_user_permissions(
        &self,
        user: &UserId,
        tenant: &TenantId,
    ) -> Result<Vec<String>> {
        if self.has_active_override(user).await? {
            return Ok(vec!["*".to_string()]);
        }

        let subject = user.subject();
        let mut holders = vec![RoleId::from_string(subject.as_str().to_string())];
        holders.extend(self.enforcer.get_user_roles(&subject, tenant).await?);

        let mut permissions = BTreeSet::new();
        for holder in &holders {
            for (resource, action) in self.enforcer.get_role_permissions(holder, tenant).await? {
                permissions.insert(format!("{resource}.{action}"));
            }
        }
        Ok(permissions.into_iter().collect())
    }

    /// Grants `(resource, action)` to `role` within `tenant`.
    pub async fn add_policy(
        &self,
        actor: &UserId,
        role: &RoleId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
    ) -> Result<()> {
        self.enforcer.add_policy(role, tenant, resource, action).await?;

        self.audit_mutation(
            AuditRecord::mutation(actor.as_str(), "policy_added", tenant.as_str())
                .with_policy_after(policy_json(role, tenant, resource, action)),
        );
        self.invalidate_local(&tenant_pattern(tenant)).await;
        self.publish_event(InvalidationEvent::new(EventAction::PolicyAdded, tenant));
        Ok(())
    }

    /// Removes the `(resource, action)` grant from `role` within `tenant`.
    pub async fn remove_policy(
        &self,
        actor: &UserId,
        role: &RoleId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
    ) -> Result<()> {
        self.enforcer.remove_policy(role, tenant, resource, action).await?;

        self.audit_mutation(
            AuditRecord::mutation(actor.as_str(), "policy_removed", tenant.as_str())
                .with_policy_before(policy_json(role, tenant, resource, action)),
        );
        self.invalidate_local(&tenant_pattern(tenant)).await;
        self.publish_event(InvalidationEvent::new(EventAction::PolicyRemoved, tenant));
        Ok(())
    }

    /// Assigns `role` to `user` within `tenant`.
    ///
    /// The durable assignment record is written first as the source of
    /// truth, then the grouping rule. If the rule write fails the record
    /// is removed again, so the two stores converge on either outcome.
    pub async fn assign_role(
        &self,
        actor: &UserId,
        user: &UserId,
        role: &RoleId,
        tenant: &TenantId,
    ) -> Result<()> {
        let assignment = RoleAssignment {
            user: user.clone(),
            role: role.clone(),
            tenant: tenant.clone(),
            assigned_by: actor.as_str().to_string(),
            assigned_at: Utc::now(),
            expires_at: None,
        };
        self.assignments
            .record(assignment)
            .await
            .map_err(Error::Store)?;

        let subject = user.subject();
        if let Err(error) = self.enforcer.assign_role(&subject, role, tenant).await {
            if let Err(rollback_error) = self
                .assignments
                .remove(user.clone(), role.clone(), tenant.clone())
                .await
            {
                warn!(
                    user = %user,
                    role = %role,
                    tenant = %tenant,
                    error = %rollback_error,
                    "assignment rollback failed; stores have diverged"
                );
            }
            return Err(error);
        }

        self.audit_mutation(
            AuditRecord::mutation(actor.as_str(), "role_assigned", tenant.as_str())
                .with_subject(subject.as_str())
                .with_policy_after(serde_json::json!({ "role": role.as_str() })),
        );
        self.invalidate_local(&subject_pattern(tenant, &subject)).await;
        self.publish_event(
            InvalidationEvent::new(EventAction::RoleAssigned, tenant).with_subject(&subject),
        );
        Ok(())
    }

    /// Revokes `role` from `user` within `tenant`.
    ///
    /// Removes the assignment record first, then the grouping rule; a
    /// rule-write failure re-records the assignment.
    pub async fn revoke_role(
        &self,
        actor: &UserId,
        user: &UserId,
        role: &RoleId,
        tenant: &TenantId,
    ) -> Result<()> {
        let previous = self
            .assignments
            .list_for_user(user.clone(), tenant.clone())
            .await
            .map_err(Error::Store)?
            .into_iter()
            .find(|assignment| &assignment.role == role);
        self.assignments
            .remove(user.clone(), role.clone(), tenant.clone())
            .await
            .map_err(Error::Store)?;

        let subject = user.subject();
        if let Err(error) = self.enforcer.revoke_role(&subject, role, tenant).await {
            if let Some(assignment) = previous
                && let Err(rollback_error) = self.assignments.record(assignment).await
            {
                warn!(
                    user = %user,
                    role = %role,
                    tenant = %tenant,
                    error = %rollback_error,
                    "revocation rollback failed; stores have diverged"
                );
            }
            return Err(error);
        }

        self.audit_mutation(
            AuditRecord::mutation(actor.as_str(), "role_revoked", tenant.as_str())
                .with_subject(subject.as_str())
                .with_policy_before(serde_json::json!({ "role": role.as_str() })),
        );
        self.invalidate_local(&subject_pattern(tenant, &subject)).await;
        self.publish_event(
            InvalidationEvent::new(EventAction::RoleRevoked, tenant).with_subject(&subject),
        );
        Ok(())
    }

    /// Records a platform-level permission grant for a user.
    ///
    /// Overrides are tenant-independent, so every tenant's cached
    /// decisions for the user become stale at once and the whole decision
    /// space is invalidated.
    pub async fn grant_platform_override(
        &self,
        actor: &UserId,
        grant: PlatformOverride,
    ) -> Result<()> {
        let subject = grant.user.subject();
        self.platform.grant(grant).await.map_err(Error::Store)?;

        self.audit_mutation(
            AuditRecord::mutation(actor.as_str(), "permission_granted", crate::types::WILDCARD_TENANT)
                .with_subject(subject.as_str()),
        );
        self.invalidate_local(&all_decisions_pattern()).await;
        self.publish_event(
            InvalidationEvent::new(EventAction::PermissionGranted, &TenantId::wildcard())
                .with_subject(&subject),
        );
        Ok(())
    }

    /// Revokes a platform-level permission grant.
    pub async fn revoke_platform_override(
        &self,
        actor: &UserId,
        user: &UserId,
        permission: &str,
    ) -> Result<bool> {
        let revoked = self
            .platform
            .revoke(user.clone(), permission.to_string())
            .await
            .map_err(Error::Store)?;
        if !revoked {
            return Ok(false);
        }

        let subject = user.subject();
        self.audit_mutation(
            AuditRecord::mutation(actor.as_str(), "permission_revoked", crate::types::WILDCARD_TENANT)
                .with_subject(subject.as_str()),
        );
        self.invalidate_local(&all_decisions_pattern()).await;
        self.publish_event(
            InvalidationEvent::new(EventAction::PermissionRevoked, &TenantId::wildcard())
                .with_subject(&subject),
        );
        Ok(true)
    }

    /// Returns the role assignments recorded for `user` within `tenant`.
    pub async fn list_role_assignments(
        &self,
        user: &UserId,
        tenant: &TenantId,
    ) -> Result<Vec<RoleAssignment>> {
        self.assignments
            .list_for_user(user.clone(), tenant.clone())
            .await
            .map_err(Error::Store)
    }

    /// Returns the underlying engine, for reload and introspection calls.
    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    /// Returns the decision cache, if one is attached.
    pub fn cache(&self) -> Option<&Arc<TieredCache>> {
        self.cache.as_ref()
    }

    /// Drains the audit trail. Call once during shutdown.
    pub async fn shutdown(&self) {
        if let Some(audit) = &self.audit {
            audit.shutdown().await;
        }
    }

    async fn has_active_override(&self, user: &UserId) -> Result<bool> {
        let grant = self
            .platform
            .active_override(user.clone())
            .await
            .map_err(Error::Store)?;
        Ok(grant.is_some_and(|grant| grant.is_active(Utc::now())))
    }

    /// Cache lookup, then engine evaluation with cache write-back.
    async fn evaluate(
        &self,
        user: &UserId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
    ) -> Result<(bool, &'static str)> {
        let subject = user.subject();
        let key = self
            .cache
            .as_ref()
            .map(|_| decision_key(tenant, &subject, resource, action));

        if let (Some(cache), Some(key)) = (&self.cache, &key)
            && let Some(allowed) = cache.get(key).await
        {
            return Ok((allowed, reason::CACHE_HIT));
        }

        let allowed = self
            .enforcer
            .check_permission(&subject, tenant, resource, action)
            .await?;

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            cache.set(key, allowed).await;
        }

        let decision_reason = if allowed {
            reason::ENFORCER_CHECK
        } else {
            reason::PERMISSION_DENIED
        };
        Ok((allowed, decision_reason))
    }

    fn audit_decision(
        &self,
        user: &UserId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
        allowed: bool,
        decision_reason: &str,
        start: Instant,
    ) {
        if let Some(audit) = &self.audit {
            audit.record(AuditRecord::decision(
                user.as_str(),
                tenant.as_str(),
                resource.as_str(),
                action.as_str(),
                allowed,
                decision_reason,
                start.elapsed().as_millis() as u64,
            ));
        }
    }

    fn audit_mutation(&self, record: AuditRecord) {
        if let Some(audit) = &self.audit {
            audit.record(record);
        }
    }

    async fn invalidate_local(&self, pattern: &str) {
        if let Some(cache) = &self.cache
            && let Err(error) = cache.delete_pattern(pattern).await
        {
            warn!(pattern, %error, "local cache invalidation failed");
        }
    }

    /// Fire-and-forget publish; a mutation never fails because the bus is
    /// unavailable.
    fn publish_event(&self, event: InvalidationEvent) {
        let publisher = Arc::clone(&self.publisher);
        tokio::spawn(async move {
            if let Err(error) = publisher.publish(&event).await {
                warn!(event_id = %event.event_id, %error, "invalidation publish failed");
            }
        });
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("cache", &self.cache.is_some())
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

fn policy_json(
    role: &RoleId,
    tenant: &TenantId,
    resource: &ResourceName,
    action: &ActionName,
) -> serde_json::Value {
    serde_json::json!({
        "role": role.as_str(),
        "tenant": tenant.as_str(),
        "resource": resource.as_str(),
        "action": action.as_str(),
    })
}
