use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{LoadConfig, LoadStrategy};
use crate::error::{Error, Result};
use crate::policy::{PolicyRule, RuleKind};
use crate::store::PolicyStore;
use crate::types::{
    ActionName, ResourceName, RoleId, SubjectId, TenantId, WILDCARD_TENANT,
};

const DEFAULT_MAX_INHERIT_DEPTH: usize = 16;

/// How the in-memory model was loaded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoadMode {
    /// Every tenant's rules are resident.
    Unfiltered,
    /// Only one tenant's rules (plus wildcard) are resident. Checks for
    /// other tenants evaluate against an incomplete model and
    /// default-deny; this is a deliberate trade-off for large policy sets.
    Filtered(TenantId),
}

/// In-memory evaluation model built from the policy store.
#[derive(Debug, Default)]
struct PolicyModel {
    rules: HashSet<PolicyRule>,
    /// `(role, tenant)` to granted `(resource, action)` pairs.
    grants: HashMap<(String, String), HashSet<(String, String)>>,
    /// `(member, tenant)` to directly assigned roles. Members are
    /// namespaced subjects or role names (role-to-role edges model
    /// hierarchy).
    memberships: HashMap<(String, String), HashSet<String>>,
}

impl PolicyModel {
    fn from_rules(rules: Vec<PolicyRule>) -> Self {
        let mut model = Self::default();
        for rule in rules {
            model.insert(rule);
        }
        model
    }

    fn contains(&self, rule: &PolicyRule) -> bool {
        self.rules.contains(rule)
    }

    fn len(&self) -> usize {
        self.rules.len()
    }

    fn insert(&mut self, rule: PolicyRule) {
        match rule.kind {
            RuleKind::Policy => {
                self.grants
                    .entry((rule.v0.clone(), rule.v1.clone()))
                    .or_default()
                    .insert((rule.v2.clone(), rule.v3.clone()));
            }
            RuleKind::Grouping => {
                self.memberships
                    .entry((rule.v0.clone(), rule.v2.clone()))
                    .or_default()
                    .insert(rule.v1.clone());
            }
        }
        self.rules.insert(rule);
    }

    fn remove(&mut self, rule: &PolicyRule) {
        if !self.rules.remove(rule) {
            return;
        }
        match rule.kind {
            RuleKind::Policy => {
                let key = (rule.v0.clone(), rule.v1.clone());
                if let Some(pairs) = self.grants.get_mut(&key) {
                    pairs.remove(&(rule.v2.clone(), rule.v3.clone()));
                    if pairs.is_empty() {
                        self.grants.remove(&key);
                    }
                }
            }
            RuleKind::Grouping => {
                let key = (rule.v0.clone(), rule.v2.clone());
                if let Some(roles) = self.memberships.get_mut(&key) {
                    roles.remove(&rule.v1);
                    if roles.is_empty() {
                        self.memberships.remove(&key);
                    }
                }
            }
        }
    }

    fn direct_roles(&self, member: &str, tenant: &str) -> impl Iterator<Item = &String> {
        let scoped = self
            .memberships
            .get(&(member.to_string(), tenant.to_string()));
        let global = self
            .memberships
            .get(&(member.to_string(), WILDCARD_TENANT.to_string()));
        scoped.into_iter().chain(global).flatten()
    }

    /// Resolves the transitive role set for a subject within a tenant,
    /// including wildcard-tenant memberships.
    fn resolve_roles(
        &self,
        subject: &SubjectId,
        tenant: &TenantId,
        max_depth: usize,
    ) -> Result<Vec<String>> {
        let mut resolved: Vec<String> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((subject.as_str().to_string(), 0));
        visited.insert(subject.as_str().to_string());

        while let Some((member, depth)) = queue.pop_front() {
            for role in self.direct_roles(&member, tenant.as_str()) {
                if visited.contains(role) {
                    continue;
                }
                if depth + 1 > max_depth {
                    return Err(Error::RoleDepthExceeded {
                        tenant: tenant.clone(),
                        subject: subject.clone(),
                        role: RoleId::from_string(role.clone()),
                        max_depth,
                    });
                }
                visited.insert(role.clone());
                resolved.push(role.clone());
                queue.push_back((role.clone(), depth + 1));
            }
        }

        Ok(resolved)
    }

    fn holder_grants(&self, holder: &str, tenant: &str, resource: &str, action: &str) -> bool {
        let pair = (resource.to_string(), action.to_string());
        [(holder.to_string(), tenant.to_string()),
            (holder.to_string(), WILDCARD_TENANT.to_string())]
        .iter()
        .any(|key| self.grants.get(key).is_some_and(|pairs| pairs.contains(&pair)))
    }

    fn check(
        &self,
        subject: &SubjectId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
        max_depth: usize,
    ) -> Result<bool> {
        if self.holder_grants(subject.as_str(), tenant.as_str(), resource.as_str(), action.as_str())
        {
            return Ok(true);
        }
        let roles = self.resolve_roles(subject, tenant, max_depth)?;
        Ok(roles.iter().any(|role| {
            self.holder_grants(role, tenant.as_str(), resource.as_str(), action.as_str())
        }))
    }
}

#[derive(Debug)]
struct EngineState {
    model: PolicyModel,
    mode: LoadMode,
}

/// Policy-evaluation engine over one mutable in-memory model.
///
/// Reads (`check_permission`, `get_user_roles`, `get_role_permissions`)
/// take a shared lock and run concurrently; mutations and reloads take
/// the exclusive lock. Mutations persist to the policy store before the
/// in-memory update, under the exclusive lock, so a store failure leaves
/// the model unchanged.
pub struct Enforcer {
    store: Arc<dyn PolicyStore>,
    state: RwLock<EngineState>,
    max_inherit_depth: usize,
}

/// Builder for [`Enforcer`].
pub struct EnforcerBuilder {
    store: Arc<dyn PolicyStore>,
    load: LoadConfig,
    max_inherit_depth: usize,
}

impl EnforcerBuilder {
    /// Creates a builder with default configuration.
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            load: LoadConfig::default(),
            max_inherit_depth: DEFAULT_MAX_INHERIT_DEPTH,
        }
    }

    /// Sets the loading strategy configuration.
    pub fn load(mut self, load: LoadConfig) -> Self {
        self.load = load;
        self
    }

    /// Sets the maximum role-resolution depth.
    pub fn max_inherit_depth(mut self, depth: usize) -> Self {
        self.max_inherit_depth = depth;
        self
    }

    /// Loads the initial model per the configured strategy and builds
    /// the engine.
    pub async fn build(self) -> Result<Enforcer> {
        let default_tenant = self
            .load
            .default_tenant
            .as_deref()
            .map(TenantId::new)
            .transpose()?;

        let mode = match self.load.strategy {
            LoadStrategy::Full => LoadMode::Unfiltered,
            LoadStrategy::Filtered => match default_tenant {
                Some(tenant) => LoadMode::Filtered(tenant),
                None => LoadMode::Unfiltered,
            },
            LoadStrategy::Adaptive => {
                let count = self.store.count_all().await.map_err(Error::Store)?;
                if count < self.load.adaptive_threshold {
                    LoadMode::Unfiltered
                } else {
                    match default_tenant {
                        Some(tenant) => LoadMode::Filtered(tenant),
                        None => LoadMode::Unfiltered,
                    }
                }
            }
        };

        let rules = match &mode {
            LoadMode::Unfiltered => self.store.load_all().await.map_err(Error::Store)?,
            LoadMode::Filtered(tenant) => self
                .store
                .load_filtered(tenant.clone())
                .await
                .map_err(Error::Store)?,
        };

        let model = PolicyModel::from_rules(rules);
        info!(
            rules = model.len(),
            mode = ?mode,
            "policy model loaded"
        );

        Ok(Enforcer {
            store: self.store,
            state: RwLock::new(EngineState { model, mode }),
            max_inherit_depth: self.max_inherit_depth,
        })
    }
}

impl Enforcer {
    /// Checks whether `subject` may perform `action` on `resource` within
    /// `tenant`. Returns `false`, not an error, when no rule matches.
    pub async fn check_permission(
        &self,
        subject: &SubjectId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
    ) -> Result<bool> {
        let state = self.state.read().await;
        state
            .model
            .check(subject, tenant, resource, action, self.max_inherit_depth)
    }

    /// Adds a policy rule, persisting before the model update.
    pub async fn add_policy(
        &self,
        role: &RoleId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
    ) -> Result<()> {
        self.apply_add(PolicyRule::policy(role, tenant, resource, action))
            .await
    }

    /// Removes a policy rule, persisting before the model update.
    pub async fn remove_policy(
        &self,
        role: &RoleId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
    ) -> Result<()> {
        self.apply_remove(PolicyRule::policy(role, tenant, resource, action))
            .await
    }

    /// Adds a grouping rule assigning `role` to `subject` within `tenant`.
    pub async fn assign_role(
        &self,
        subject: &SubjectId,
        role: &RoleId,
        tenant: &TenantId,
    ) -> Result<()> {
        self.apply_add(PolicyRule::grouping(subject, role, tenant))
            .await
    }

    /// Removes a grouping rule.
    pub async fn revoke_role(
        &self,
        subject: &SubjectId,
        role: &RoleId,
        tenant: &TenantId,
    ) -> Result<()> {
        self.apply_remove(PolicyRule::grouping(subject, role, tenant))
            .await
    }

    /// Returns the transitive role set for a subject within a tenant.
    pub async fn get_user_roles(
        &self,
        subject: &SubjectId,
        tenant: &TenantId,
    ) -> Result<Vec<RoleId>> {
        let state = self.state.read().await;
        let mut roles = state
            .model
            .resolve_roles(subject, tenant, self.max_inherit_depth)?;
        roles.sort_unstable();
        Ok(roles.into_iter().map(RoleId::from_string).collect())
    }

    /// Returns `(resource, action)` pairs granted to a role within a
    /// tenant, including wildcard-tenant grants.
    pub async fn get_role_permissions(
        &self,
        role: &RoleId,
        tenant: &TenantId,
    ) -> Result<Vec<(ResourceName, ActionName)>> {
        let state = self.state.read().await;
        let mut pairs: Vec<(String, String)> = [
            (role.as_str().to_string(), tenant.as_str().to_string()),
            (role.as_str().to_string(), WILDCARD_TENANT.to_string()),
        ]
        .iter()
        .filter_map(|key| state.model.grants.get(key))
        .flatten()
        .cloned()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
        pairs.sort_unstable();
        Ok(pairs
            .into_iter()
            .map(|(resource, action)| {
                (
                    ResourceName::from_string(resource),
                    ActionName::from_string(action),
                )
            })
            .collect())
    }

    /// Reloads the full model from the policy store, honoring the
    /// current load mode.
    pub async fn reload_policy(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let rules = match &state.mode {
            LoadMode::Unfiltered => self.store.load_all().await.map_err(Error::Store)?,
            LoadMode::Filtered(tenant) => self
                .store
                .load_filtered(tenant.clone())
                .await
                .map_err(Error::Store)?,
        };
        state.model = PolicyModel::from_rules(rules);
        debug!(rules = state.model.len(), "policy model reloaded");
        Ok(())
    }

    /// Switches into filtered mode scoped to one tenant. Only that
    /// tenant's rules (plus wildcard) stay resident afterwards.
    pub async fn load_filtered_policy(&self, tenant: TenantId) -> Result<()> {
        let mut state = self.state.write().await;
        let rules = self
            .store
            .load_filtered(tenant.clone())
            .await
            .map_err(Error::Store)?;
        state.model = PolicyModel::from_rules(rules);
        state.mode = LoadMode::Filtered(tenant);
        debug!(rules = state.model.len(), "policy model loaded filtered");
        Ok(())
    }

    /// Returns the current load mode.
    pub async fn load_mode(&self) -> LoadMode {
        self.state.read().await.mode.clone()
    }

    /// Returns the number of rules resident in the model.
    pub async fn rule_count(&self) -> usize {
        self.state.read().await.model.len()
    }

    async fn apply_add(&self, rule: PolicyRule) -> Result<()> {
        let mut state = self.state.write().await;
        if state.model.contains(&rule) {
            return Err(Error::RuleExists(rule));
        }
        let added = self
            .store
            .add_rule(rule.clone())
            .await
            .map_err(Error::Store)?;
        if !added {
            return Err(Error::RuleExists(rule));
        }
        state.model.insert(rule);
        Ok(())
    }

    async fn apply_remove(&self, rule: PolicyRule) -> Result<()> {
        let mut state = self.state.write().await;
        let removed = self
            .store
            .remove_rule(rule.clone())
            .await
            .map_err(Error::Store)?;
        if !removed {
            return Err(Error::RuleNotFound(rule));
        }
        state.model.remove(&rule);
        Ok(())
    }
}

impl std::fmt::Debug for Enforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enforcer")
            .field("max_inherit_depth", &self.max_inherit_depth)
            .finish_non_exhaustive()
    }
}
