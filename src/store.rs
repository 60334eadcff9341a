use crate::error::StoreError;
use crate::policy::{PolicyRule, RuleKind};
use crate::types::{RoleId, TenantId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Tenant-independent capability held directly by a user.
///
/// An entry whose `expires_at` lies in the past is treated as absent
/// without being deleted eagerly.
#[derive(Clone, Debug, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct PlatformOverride {
    pub user: UserId,
    pub permission: String,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PlatformOverride {
    /// Returns whether the grant is active at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expiry| expiry > now)
    }
}

/// Durable record of a role assignment, mirrored into a grouping rule
/// for runtime evaluation.
#[derive(Clone, Debug, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct RoleAssignment {
    pub user: UserId,
    pub role: RoleId,
    pub tenant: TenantId,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Durable, tenant-aware storage for policy and grouping rules.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Loads every rule.
    async fn load_all(&self) -> std::result::Result<Vec<PolicyRule>, StoreError>;

    /// Loads rules whose tenant field equals `tenant` or the wildcard scope.
    async fn load_filtered(
        &self,
        tenant: TenantId,
    ) -> std::result::Result<Vec<PolicyRule>, StoreError>;

    /// Replaces the full rule set.
    async fn save(&self, rules: Vec<PolicyRule>) -> std::result::Result<(), StoreError>;

    /// Adds a rule. Returns `false` when the rule already exists.
    async fn add_rule(&self, rule: PolicyRule) -> std::result::Result<bool, StoreError>;

    /// Removes a rule. Returns `false` when the rule is absent.
    async fn remove_rule(&self, rule: PolicyRule) -> std::result::Result<bool, StoreError>;

    /// Removes rules of `kind` matching `values` from `field_index` on.
    /// Empty values match any field. Returns the removed rules.
    async fn remove_matching(
        &self,
        kind: RuleKind,
        field_index: usize,
        values: Vec<String>,
    ) -> std::result::Result<Vec<PolicyRule>, StoreError>;

    /// Atomically removes `old` and adds `new` in one transaction.
    ///
    /// Callers must never observe a state with the old rules removed but
    /// the new rules not yet present, or vice versa.
    async fn update_rules(
        &self,
        old: Vec<PolicyRule>,
        new: Vec<PolicyRule>,
    ) -> std::result::Result<(), StoreError>;

    /// Counts every rule.
    async fn count_all(&self) -> std::result::Result<usize, StoreError>;

    /// Counts rules resident for a filtered load of `tenant`.
    async fn count_by_tenant(&self, tenant: TenantId) -> std::result::Result<usize, StoreError>;
}

/// Durable storage for global, tenant-independent permission grants.
#[async_trait]
pub trait PlatformStore: Send + Sync {
    /// Returns an active (not expired) override for `user`, if any.
    async fn active_override(
        &self,
        user: UserId,
    ) -> std::result::Result<Option<PlatformOverride>, StoreError>;

    /// Records a grant.
    async fn grant(&self, grant: PlatformOverride) -> std::result::Result<(), StoreError>;

    /// Revokes a grant. Returns `false` when no grant was present.
    async fn revoke(
        &self,
        user: UserId,
        permission: String,
    ) -> std::result::Result<bool, StoreError>;
}

/// Durable storage for role-assignment records.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Records an assignment.
    async fn record(&self, assignment: RoleAssignment) -> std::result::Result<(), StoreError>;

    /// Removes an assignment record. Returns `false` when absent.
    async fn remove(
        &self,
        user: UserId,
        role: RoleId,
        tenant: TenantId,
    ) -> std::result::Result<bool, StoreError>;

    /// Lists assignment records for a user within a tenant.
    async fn list_for_user(
        &self,
        user: UserId,
        tenant: TenantId,
    ) -> std::result::Result<Vec<RoleAssignment>, StoreError>;
}
