use crate::policy::PolicyRule;
use crate::types::{RoleId, SubjectId, TenantId};
use thiserror::Error;

/// Store-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
///
/// Policy-state conditions ([`Error::RuleExists`], [`Error::RuleNotFound`])
/// are distinct from store failures so callers can branch between an
/// idempotent retry and a hard infrastructure failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Store error wrapper.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// Malformed subject, tenant, resource, or action input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The rule is already present in the policy store.
    #[error("rule already exists: {0}")]
    RuleExists(PolicyRule),
    /// The rule is not present in the policy store.
    #[error("rule not found: {0}")]
    RuleNotFound(PolicyRule),
    /// Role membership traversal exceeded the configured depth.
    #[error(
        "role resolution depth exceeded for subject {subject} in tenant {tenant} at role {role}; max depth {max_depth}"
    )]
    RoleDepthExceeded {
        tenant: TenantId,
        subject: SubjectId,
        role: RoleId,
        max_depth: usize,
    },
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl Error {
    /// Returns whether the error reports a policy-state condition rather
    /// than an infrastructure failure.
    pub fn is_policy_state(&self) -> bool {
        matches!(self, Self::RuleExists(_) | Self::RuleNotFound(_))
    }
}
