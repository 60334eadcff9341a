//! Multi-tenant RBAC authorization decision engine.
//!
//! This crate evaluates `(user, tenant, resource, action)` permission
//! checks against policy and grouping rules in the fixed `ptype, v0..v5`
//! column layout, with deny-by-default semantics and a wildcard `*`
//! tenant scope shared by every tenant. Around the core engine it layers
//! a platform-override tier, a two-tier decision cache, a cache
//! invalidation bus, and an asynchronous audit trail, combined behind the
//! [`Guard`] facade in a fixed decision order.
//!
//! # Examples
//!
//! Basic enforcement flow over the in-memory stores:
//! ```no_run
//! use std::sync::Arc;
//! use tenant_guard::{
//!     ActionName, EnforcerBuilder, GuardBuilder, MemoryStore, ResourceName, RoleId, TenantId,
//!     UserId,
//! };
//!
//! # async fn demo() -> tenant_guard::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let enforcer = EnforcerBuilder::new(store.clone() as _).build().await?;
//! let guard = GuardBuilder::new(Arc::new(enforcer), store.clone() as _, store as _).build();
//!
//! let admin = UserId::try_from("admin")?;
//! let tenant = TenantId::try_from("acme")?;
//! let role = RoleId::try_from("editor")?;
//! let resource = ResourceName::try_from("document")?;
//! let action = ActionName::try_from("edit")?;
//!
//! guard.add_policy(&admin, &role, &tenant, &resource, &action).await?;
//! guard.assign_role(&admin, &UserId::try_from("7")?, &role, &tenant).await?;
//! let allowed = guard
//!     .check_permission(&UserId::try_from("7")?, &tenant, &resource, &action)
//!     .await?;
//! assert!(allowed);
//! # Ok(())
//! # }
//! ```
//!
//! Attaching the two-tier decision cache:
//! ```no_run
//! use std::time::Duration;
//! use tenant_guard::{MemorySharedCache, TieredCache};
//!
//! let cache = TieredCache::new(
//!     10_000,
//!     Duration::from_secs(60),
//!     Duration::from_secs(300),
//!     MemorySharedCache::new(),
//! );
//! # let _ = cache;
//! ```
#![forbid(unsafe_code)]

mod audit;
mod bus;
mod cache;
mod config;
mod engine;
mod error;
mod facade;
mod memory_cache;
mod memory_store;
mod policy;
mod store;
mod types;

pub use crate::audit::{
    ActorType, AuditQuery, AuditRecord, AuditSink, AuditTrail, MemoryAuditSink, export_csv,
    export_json, reason,
};
pub use crate::bus::{
    Disposition, EventAction, EventDetails, EventPublisher, InvalidationConsumer,
    InvalidationEvent, MemoryBus, NoopPublisher,
};
pub use crate::cache::{
    CacheStats, CachedDecision, NoSharedCache, SharedCache, TieredCache, all_decisions_pattern,
    decision_key, subject_pattern, tenant_pattern,
};
pub use crate::config::{AuditConfig, CacheConfig, GuardConfig, LoadConfig, LoadStrategy};
pub use crate::engine::{Enforcer, EnforcerBuilder, LoadMode};
pub use crate::error::{Error, Result, StoreError};
pub use crate::facade::{Guard, GuardBuilder};
pub use crate::memory_cache::MemorySharedCache;
pub use crate::memory_store::MemoryStore;
pub use crate::policy::{PolicyRule, RuleKind};
pub use crate::store::{
    AssignmentStore, PlatformOverride, PlatformStore, PolicyStore, RoleAssignment,
};
pub use crate::types::{
    ActionName, ResourceName, RoleId, SubjectId, TenantId, UserId, WILDCARD_TENANT,
};
