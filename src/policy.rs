use crate::types::{ActionName, ResourceName, RoleId, SubjectId, TenantId};
use std::fmt;

/// Rule relation kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Grants `(role, tenant, resource, action)`.
    Policy,
    /// Assigns `(subject, role, tenant)`.
    Grouping,
}

impl RuleKind {
    /// Returns the persisted `ptype` column value.
    pub fn ptype(self) -> &'static str {
        match self {
            Self::Policy => "p",
            Self::Grouping => "g",
        }
    }

    /// Parses a persisted `ptype` column value.
    pub fn from_ptype(value: &str) -> Option<Self> {
        match value {
            "p" => Some(Self::Policy),
            "g" => Some(Self::Grouping),
            _ => None,
        }
    }
}

/// A policy or grouping rule in the fixed `(ptype, v0..v5)` column layout.
///
/// Policy rules lay out as `p, role, tenant, resource, action`; grouping
/// rules as `g, subject, role, tenant`. A rule is uniquely identified by
/// its full tuple. The trailing columns are reserved and stay empty.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct PolicyRule {
    pub kind: RuleKind,
    pub v0: String,
    pub v1: String,
    pub v2: String,
    pub v3: String,
    pub v4: String,
    pub v5: String,
}

impl PolicyRule {
    /// Creates a policy rule granting `(role, tenant, resource, action)`.
    pub fn policy(
        role: &RoleId,
        tenant: &TenantId,
        resource: &ResourceName,
        action: &ActionName,
    ) -> Self {
        Self {
            kind: RuleKind::Policy,
            v0: role.as_str().to_string(),
            v1: tenant.as_str().to_string(),
            v2: resource.as_str().to_string(),
            v3: action.as_str().to_string(),
            v4: String::new(),
            v5: String::new(),
        }
    }

    /// Creates a grouping rule assigning `(subject, role, tenant)`.
    pub fn grouping(subject: &SubjectId, role: &RoleId, tenant: &TenantId) -> Self {
        Self {
            kind: RuleKind::Grouping,
            v0: subject.as_str().to_string(),
            v1: role.as_str().to_string(),
            v2: tenant.as_str().to_string(),
            v3: String::new(),
            v4: String::new(),
            v5: String::new(),
        }
    }

    /// Returns the tenant field for this rule's kind.
    pub fn tenant(&self) -> &str {
        match self.kind {
            RuleKind::Policy => &self.v1,
            RuleKind::Grouping => &self.v2,
        }
    }

    /// Returns whether this rule is resident when loading for `tenant`.
    ///
    /// Wildcard-scoped rules are resident in every filtered load.
    pub fn in_tenant_scope(&self, tenant: &TenantId) -> bool {
        let field = self.tenant();
        field == tenant.as_str() || field == crate::types::WILDCARD_TENANT
    }

    /// Returns the field at `index` within `v0..v5`.
    pub fn field(&self, index: usize) -> Option<&str> {
        match index {
            0 => Some(&self.v0),
            1 => Some(&self.v1),
            2 => Some(&self.v2),
            3 => Some(&self.v3),
            4 => Some(&self.v4),
            5 => Some(&self.v5),
            _ => None,
        }
    }

    /// Matches `values` against fields starting at `field_index`.
    ///
    /// An empty value matches any field, mirroring filtered removal in
    /// `ptype, v0..v5` stores.
    pub fn matches_fields(&self, field_index: usize, values: &[String]) -> bool {
        values.iter().enumerate().all(|(offset, value)| {
            value.is_empty()
                || self
                    .field(field_index + offset)
                    .is_some_and(|field| field == value)
        })
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RuleKind::Policy => write!(f, "p({}, {}, {}, {})", self.v0, self.v1, self.v2, self.v3),
            RuleKind::Grouping => write!(f, "g({}, {}, {})", self.v0, self.v1, self.v2),
        }
    }
}
