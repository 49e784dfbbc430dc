//! Strongly-typed identifiers.

use super::environment::Environment;
use crate::error::IdentifierError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_TENANT_LEN: usize = 64;
const MAX_SEGMENT_LEN: usize = 64;
const MAX_KEY_LEN: usize = 128;

/// Maximum namespace depth (`a/b/c` has depth 3).
pub const MAX_NAMESPACE_DEPTH: usize = 16;

fn check_chars(kind: &'static str, value: &str, max: usize, extra: &[char]) -> Result<(), IdentifierError> {
    if value.is_empty() {
        return Err(IdentifierError::Empty { kind });
    }
    if value.len() > max {
        return Err(IdentifierError::TooLong { kind, max });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || extra.contains(&c))
    {
        return Err(IdentifierError::InvalidChars {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Get the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id! {
    /// Tenant identifier.
    TenantId
}

impl TenantId {
    /// Create a validated tenant ID.
    pub fn new(id: impl Into<String>) -> Result<Self, IdentifierError> {
        let id = id.into();
        check_chars("tenant id", &id, MAX_TENANT_LEN, &[])?;
        Ok(Self(id))
    }
}

impl FromStr for TenantId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

string_id! {
    /// Hierarchical namespace path within a tenant, e.g. `payments/prod`.
    Namespace
}

impl Namespace {
    /// Create a validated namespace path.
    pub fn new(path: impl Into<String>) -> Result<Self, IdentifierError> {
        let path = path.into();
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty { kind: "namespace" });
        }
        let depth = trimmed.split('/').count();
        if depth > MAX_NAMESPACE_DEPTH {
            return Err(IdentifierError::TooDeep {
                depth,
                max: MAX_NAMESPACE_DEPTH,
            });
        }
        for segment in trimmed.split('/') {
            check_chars("namespace segment", segment, MAX_SEGMENT_LEN, &[])?;
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Path segments, outermost first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Depth of the path.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Parent namespace, if any.
    pub fn parent(&self) -> Option<Namespace> {
        self.0.rsplit_once('/').map(|(parent, _)| Self(parent.to_string()))
    }

    /// Create a child namespace.
    pub fn child(&self, segment: &str) -> Result<Namespace, IdentifierError> {
        Self::new(format!("{}/{}", self.0, segment))
    }

    /// Whether `self` equals `other` or lies beneath it.
    pub fn is_within(&self, other: &Namespace) -> bool {
        self.0 == other.0
            || (self.0.starts_with(other.as_str()) && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }
}

impl FromStr for Namespace {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

string_id! {
    /// Key name within a namespace.
    KeyName
}

impl KeyName {
    /// Create a validated key name. Dots are allowed (`db.password`).
    pub fn new(key: impl Into<String>) -> Result<Self, IdentifierError> {
        let key = key.into();
        check_chars("key", &key, MAX_KEY_LEN, &['.'])?;
        Ok(Self(key))
    }
}

impl FromStr for KeyName {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

string_id! {
    /// Who performed an action: a user, a service, or the engine itself.
    ActorId
}

impl ActorId {
    /// Create an actor ID. Any non-empty string is accepted.
    pub fn new(actor: impl Into<String>) -> Self {
        let actor = actor.into();
        if actor.trim().is_empty() {
            Self("anonymous".to_string())
        } else {
            Self(actor)
        }
    }

    /// The engine acting on its own behalf.
    pub fn system() -> Self {
        Self("system".to_string())
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

string_id! {
    /// Identifier of a key-encryption key held by the key service.
    KekId
}

impl KekId {
    /// Wrap a provider-issued KEK identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

string_id! {
    /// Identifier of a data key.
    DataKeyId
}

impl DataKeyId {
    /// Generate a fresh data key ID.
    pub fn generate() -> Self {
        Self(crate::id::prefixed("dk"))
    }

    /// Wrap an existing ID (e.g. read back from storage).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

string_id! {
    /// Rotation job identifier.
    JobId
}

impl JobId {
    /// Generate a fresh, time-sortable job ID.
    pub fn generate() -> Self {
        Self(format!("rot-{}", crate::id::timestamp_id()))
    }

    /// Wrap an existing ID.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Fully-qualified address of a configuration entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub tenant: TenantId,
    pub namespace: Namespace,
    pub key: KeyName,
    #[serde(default, skip_serializing_if = "Environment::is_base")]
    pub environment: Environment,
}

impl EntryKey {
    /// Build an entry key from validated parts.
    pub fn new(tenant: TenantId, namespace: Namespace, key: KeyName) -> Self {
        Self {
            tenant,
            namespace,
            key,
            environment: Environment::Base,
        }
    }

    /// The same entry in another environment layer.
    pub fn in_environment(&self, environment: Environment) -> Self {
        Self {
            environment,
            ..self.clone()
        }
    }

    /// Build an entry key from raw strings, validating each part.
    pub fn parse(tenant: &str, namespace: &str, key: &str) -> Result<Self, IdentifierError> {
        Ok(Self::new(
            TenantId::new(tenant)?,
            Namespace::new(namespace)?,
            KeyName::new(key)?,
        ))
    }

    /// Resource string used in audit records and authorization requests.
    pub fn resource(&self) -> String {
        self.to_string()
    }

    /// Filesystem-safe, collision-free file stem.
    pub fn file_stem(&self) -> String {
        crate::id::sha256_hex(self.to_string().as_bytes())
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.tenant, self.namespace, self.key)?;
        if !self.environment.is_base() {
            write!(f, "#{}", self.environment)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_validation() {
        assert!(TenantId::new("acme").is_ok());
        assert!(TenantId::new("acme-corp_1").is_ok());
        assert!(matches!(
            TenantId::new(""),
            Err(IdentifierError::Empty { .. })
        ));
        assert!(matches!(
            TenantId::new("acme/evil"),
            Err(IdentifierError::InvalidChars { .. })
        ));
        assert!(matches!(
            TenantId::new("a".repeat(65)),
            Err(IdentifierError::TooLong { .. })
        ));
    }

    #[test]
    fn test_namespace_normalizes_slashes() {
        let ns = Namespace::new("/payments/prod/").unwrap();
        assert_eq!(ns.as_str(), "payments/prod");
        assert_eq!(ns.depth(), 2);
    }

    #[test]
    fn test_namespace_rejects_empty_segment_and_traversal() {
        assert!(Namespace::new("a//b").is_err());
        assert!(Namespace::new("a/../b").is_err());
        assert!(Namespace::new("///").is_err());
    }

    #[test]
    fn test_namespace_depth_limit() {
        let deep = vec!["x"; MAX_NAMESPACE_DEPTH + 1].join("/");
        assert!(matches!(
            Namespace::new(deep),
            Err(IdentifierError::TooDeep { .. })
        ));
    }

    #[test]
    fn test_namespace_hierarchy() {
        let ns = Namespace::new("payments/prod/eu").unwrap();
        assert_eq!(ns.parent().unwrap().as_str(), "payments/prod");
        assert!(ns.is_within(&Namespace::new("payments").unwrap()));
        assert!(!ns.is_within(&Namespace::new("pay").unwrap()));
        assert_eq!(
            ns.child("west").unwrap().as_str(),
            "payments/prod/eu/west"
        );
    }

    #[test]
    fn test_key_name_allows_dots() {
        assert!(KeyName::new("db.password").is_ok());
        assert!(KeyName::new("has space").is_err());
    }

    #[test]
    fn test_entry_key_display_and_stem() {
        let key = EntryKey::parse("acme", "payments/prod", "db.password").unwrap();
        assert_eq!(key.to_string(), "acme:payments/prod/db.password");
        assert_eq!(key.file_stem().len(), 64);
        let other = EntryKey::parse("acme", "payments", "prod.db.password").unwrap();
        assert_ne!(key.file_stem(), other.file_stem());
    }

    #[test]
    fn test_environment_layer_is_part_of_the_address() {
        let base = EntryKey::parse("acme", "payments", "timeout").unwrap();
        let prod = base.in_environment(Environment::Production);
        assert_eq!(prod.to_string(), "acme:payments/timeout#production");
        assert_ne!(base, prod);
        assert_ne!(base.file_stem(), prod.file_stem());

        // Base keys keep their original encoding.
        let json = serde_json::to_value(&base).unwrap();
        assert!(json.get("environment").is_none());
        let back: EntryKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, base);
    }

    #[test]
    fn test_actor_blank_becomes_anonymous() {
        assert_eq!(ActorId::new("  ").as_str(), "anonymous");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(DataKeyId::generate(), DataKeyId::generate());
        assert!(JobId::generate().as_str().starts_with("rot-"));
    }
}
