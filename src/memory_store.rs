use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StoreError;
use crate::policy::{PolicyRule, RuleKind};
use crate::store::{
    AssignmentStore, PlatformOverride, PlatformStore, PolicyStore, RoleAssignment,
};
use crate::types::{RoleId, TenantId, UserId};

/// In-memory store implementation for tests and single-node deployments.
///
/// Implements every store boundary over shared locked state. Batch
/// mutations hold one write lock, so `update_rules` is atomic.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    rules: RwLock<Vec<PolicyRule>>,
    overrides: RwLock<Vec<PlatformOverride>>,
    assignments: RwLock<Vec<RoleAssignment>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a rule without going through the engine mutation path.
    pub fn seed_rule(&self, rule: PolicyRule) {
        let mut guard = self.inner.rules.write().expect("poisoned lock");
        if !guard.contains(&rule) {
            guard.push(rule);
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn load_all(&self) -> std::result::Result<Vec<PolicyRule>, StoreError> {
        let guard = self.inner.rules.read().expect("poisoned lock");
        Ok(guard.clone())
    }

    async fn load_filtered(
        &self,
        tenant: TenantId,
    ) -> std::result::Result<Vec<PolicyRule>, StoreError> {
        let guard = self.inner.rules.read().expect("poisoned lock");
        Ok(guard
            .iter()
            .filter(|rule| rule.in_tenant_scope(&tenant))
            .cloned()
            .collect())
    }

    async fn save(&self, rules: Vec<PolicyRule>) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.rules.write().expect("poisoned lock");
        *guard = rules;
        Ok(())
    }

    async fn add_rule(&self, rule: PolicyRule) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.rules.write().expect("poisoned lock");
        if guard.contains(&rule) {
            return Ok(false);
        }
        guard.push(rule);
        Ok(true)
    }

    async fn remove_rule(&self, rule: PolicyRule) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.rules.write().expect("poisoned lock");
        let before = guard.len();
        guard.retain(|existing| existing != &rule);
        Ok(guard.len() != before)
    }

    async fn remove_matching(
        &self,
        kind: RuleKind,
        field_index: usize,
        values: Vec<String>,
    ) -> std::result::Result<Vec<PolicyRule>, StoreError> {
        let mut guard = self.inner.rules.write().expect("poisoned lock");
        let (removed, kept): (Vec<PolicyRule>, Vec<PolicyRule>) = guard
            .drain(..)
            .partition(|rule| rule.kind == kind && rule.matches_fields(field_index, &values));
        *guard = kept;
        Ok(removed)
    }

    async fn update_rules(
        &self,
        old: Vec<PolicyRule>,
        new: Vec<PolicyRule>,
    ) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.rules.write().expect("poisoned lock");
        guard.retain(|existing| !old.contains(existing));
        for rule in new {
            if !guard.contains(&rule) {
                guard.push(rule);
            }
        }
        Ok(())
    }

    async fn count_all(&self) -> std::result::Result<usize, StoreError> {
        let guard = self.inner.rules.read().expect("poisoned lock");
        Ok(guard.len())
    }

    async fn count_by_tenant(&self, tenant: TenantId) -> std::result::Result<usize, StoreError> {
        let guard = self.inner.rules.read().expect("poisoned lock");
        Ok(guard
            .iter()
            .filter(|rule| rule.in_tenant_scope(&tenant))
            .count())
    }
}

#[async_trait]
impl PlatformStore for MemoryStore {
    async fn active_override(
        &self,
        user: UserId,
    ) -> std::result::Result<Option<PlatformOverride>, StoreError> {
        let now = Utc::now();
        let guard = self.inner.overrides.read().expect("poisoned lock");
        Ok(guard
            .iter()
            .find(|grant| grant.user == user && grant.is_active(now))
            .cloned())
    }

    async fn grant(&self, grant: PlatformOverride) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.overrides.write().expect("poisoned lock");
        guard.retain(|existing| {
            !(existing.user == grant.user && existing.permission == grant.permission)
        });
        guard.push(grant);
        Ok(())
    }

    async fn revoke(
        &self,
        user: UserId,
        permission: String,
    ) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.overrides.write().expect("poisoned lock");
        let before = guard.len();
        guard.retain(|existing| !(existing.user == user && existing.permission == permission));
        Ok(guard.len() != before)
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn record(&self, assignment: RoleAssignment) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.assignments.write().expect("poisoned lock");
        guard.retain(|existing| {
            !(existing.user == assignment.user
                && existing.role == assignment.role
                && existing.tenant == assignment.tenant)
        });
        guard.push(assignment);
        Ok(())
    }

    async fn remove(
        &self,
        user: UserId,
        role: RoleId,
        tenant: TenantId,
    ) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.assignments.write().expect("poisoned lock");
        let before = guard.len();
        guard.retain(|existing| {
            !(existing.user == user && existing.role == role && existing.tenant == tenant)
        });
        Ok(guard.len() != before)
    }

    async fn list_for_user(
        &self,
        user: UserId,
        tenant: TenantId,
    ) -> std::result::Result<Vec<RoleAssignment>, StoreError> {
        let guard = self.inner.assignments.read().expect("poisoned lock");
        Ok(guard
            .iter()
            .filter(|existing| existing.user == user && existing.tenant == tenant)
            .cloned()
            .collect())
    }
}
