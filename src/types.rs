use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::fmt;

const MAX_NAME_LEN: usize = 128;

/// Tenant scope that applies to every tenant.
pub const WILDCARD_TENANT: &str = "*";

fn validate_simple_name(value: &str, kind: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if !trimmed.chars().all(is_allowed_name_char) {
        return Err(Error::InvalidInput(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn is_allowed_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-' | '.')
}

macro_rules! define_id_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash)]
        #[derive(serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a validated identifier.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                validate_simple_name(value.as_ref(), $kind).map(Self)
            }

            /// Creates an identifier from a trusted string without validation.
            pub fn from_string(value: String) -> Self {
                Self(value)
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from_string(value)
            }
        }
    };
}

define_id_type!(
    /// User identifier as known to the caller, without subject namespacing.
    UserId,
    "user id"
);
define_id_type!(
    /// Namespaced subject identifier used in the policy relation space.
    SubjectId,
    "subject id"
);
define_id_type!(
    /// Role identifier.
    RoleId,
    "role id"
);
define_id_type!(
    /// Resource name.
    ResourceName,
    "resource name"
);
define_id_type!(
    /// Action name.
    ActionName,
    "action name"
);

/// Tenant identifier. `"*"` denotes the wildcard scope applicable to all tenants.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a validated tenant identifier.
    pub fn new(value: impl AsRef<str>) -> Result<Self> {
        let raw = value.as_ref().trim();
        if raw == WILDCARD_TENANT {
            return Ok(Self(WILDCARD_TENANT.to_string()));
        }
        validate_simple_name(raw, "tenant id").map(Self)
    }

    /// Creates a tenant identifier from a trusted string without validation.
    pub fn from_string(value: String) -> Self {
        Self(value)
    }

    /// Returns the wildcard tenant scope.
    pub fn wildcard() -> Self {
        Self(WILDCARD_TENANT.to_string())
    }

    /// Returns whether this is the wildcard scope.
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD_TENANT
    }

    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TenantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for TenantId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

impl UserId {
    /// Returns the namespaced subject form of this user, e.g. `user:7`.
    ///
    /// The namespace disambiguates user ids from role names living in the
    /// same grouping relation space.
    pub fn subject(&self) -> SubjectId {
        SubjectId::from_string(format!("user:{}", self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::{SubjectId, TenantId, UserId};

    #[test]
    fn user_id_subject_is_namespaced() {
        let user = UserId::try_from("7").expect("user id");
        assert_eq!(user.subject().as_str(), "user:7");
    }

    #[test]
    fn tenant_id_accepts_wildcard() {
        let tenant = TenantId::try_from("*").expect("wildcard tenant");
        assert!(tenant.is_wildcard());
    }

    #[test]
    fn tenant_id_rejects_embedded_wildcard() {
        assert!(TenantId::try_from("ac*me").is_err());
    }

    #[test]
    fn subject_id_rejects_empty() {
        assert!(SubjectId::try_from("   ").is_err());
    }
}
