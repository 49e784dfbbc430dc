//! Authorization gate consulted before every engine operation.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use strongbox_core::{ActorId, TenantId};

/// What the caller is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
    Rotate,
    VerifySecret,
    ReadAudit,
    ManageTenant,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Rotate => "rotate",
            Self::VerifySecret => "verify_secret",
            Self::ReadAudit => "read_audit",
            Self::ManageTenant => "manage_tenant",
        }
    }

    /// Scope an actor needs for this operation.
    pub fn required_scope(self) -> Scope {
        match self {
            Self::Read | Self::VerifySecret => Scope::Read,
            Self::Write => Scope::Write,
            Self::Rotate => Scope::Rotate,
            Self::ReadAudit => Scope::Audit,
            Self::ManageTenant => Scope::Admin,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decides whether `actor` may perform `operation` on `resource`.
///
/// `tenant` is set for tenant-scoped resources.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        actor: &ActorId,
        tenant: Option<&TenantId>,
        resource: &str,
        operation: Operation,
    ) -> Decision;
}

/// Allows everything. For embedded use behind an existing access layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _: &ActorId, _: Option<&TenantId>, _: &str, _: Operation) -> Decision {
        Decision::Allow
    }
}

/// Authorization scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Everything, including tenant management.
    Admin,
    Read,
    Write,
    Rotate,
    Audit,
}

/// Scopes granted to one actor, optionally restricted to some tenants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grant {
    pub scopes: HashSet<Scope>,

    /// Tenants the grant applies to. Empty means all tenants.
    pub tenants: HashSet<TenantId>,
}

impl Grant {
    pub fn new(scopes: impl IntoIterator<Item = Scope>) -> Self {
        Self {
            scopes: scopes.into_iter().collect(),
            tenants: HashSet::new(),
        }
    }

    pub fn admin() -> Self {
        Self::new([Scope::Admin])
    }

    pub fn for_tenant(mut self, tenant: TenantId) -> Self {
        self.tenants.insert(tenant);
        self
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&Scope::Admin) || self.scopes.contains(&scope)
    }

    fn covers(&self, tenant: Option<&TenantId>) -> bool {
        match tenant {
            _ if self.tenants.is_empty() => true,
            Some(t) => self.tenants.contains(t),
            None => false,
        }
    }
}

/// Static actor → scope table.
#[derive(Debug, Default)]
pub struct ScopedAuthorizer {
    grants: RwLock<HashMap<ActorId, Grant>>,
}

impl ScopedAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, actor: ActorId, grant: Grant) {
        self.grants.write().insert(actor, grant);
    }

    pub fn revoke(&self, actor: &ActorId) {
        self.grants.write().remove(actor);
    }
}

#[async_trait]
impl Authorizer for ScopedAuthorizer {
    async fn authorize(
        &self,
        actor: &ActorId,
        tenant: Option<&TenantId>,
        _resource: &str,
        operation: Operation,
    ) -> Decision {
        let grants = self.grants.read();
        let Some(grant) = grants.get(actor) else {
            return Decision::Deny(format!("no grant for {actor}"));
        };
        if !grant.has_scope(operation.required_scope()) {
            return Decision::Deny(format!("{actor} lacks scope for {operation}"));
        }
        if !grant.covers(tenant) {
            return Decision::Deny(format!("{actor} has no access to this tenant"));
        }
        Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    #[tokio::test]
    async fn test_scoped_authorizer() {
        let authz = ScopedAuthorizer::new();
        let reader = ActorId::new("reader");
        authz.grant(reader.clone(), Grant::new([Scope::Read]).for_tenant(acme()));

        let read = authz.authorize(&reader, Some(&acme()), "acme:app/k", Operation::Read).await;
        assert!(read.is_allowed());

        let write = authz.authorize(&reader, Some(&acme()), "acme:app/k", Operation::Write).await;
        assert!(!write.is_allowed());

        let other = TenantId::new("beta").unwrap();
        let cross = authz.authorize(&reader, Some(&other), "beta:app/k", Operation::Read).await;
        assert!(!cross.is_allowed());

        let unknown = authz.authorize(&ActorId::new("mallory"), None, "*", Operation::Read).await;
        assert!(matches!(unknown, Decision::Deny(_)));
    }

    #[tokio::test]
    async fn test_admin_grants_everything() {
        let authz = ScopedAuthorizer::new();
        let root = ActorId::new("root");
        authz.grant(root.clone(), Grant::admin());

        for op in [Operation::Read, Operation::Rotate, Operation::ReadAudit, Operation::ManageTenant] {
            assert!(authz.authorize(&root, None, "*", op).await.is_allowed());
        }

        authz.revoke(&root);
        assert!(!authz.authorize(&root, None, "*", Operation::Read).await.is_allowed());
    }

    #[test]
    fn test_operation_scopes() {
        assert_eq!(Operation::VerifySecret.required_scope(), Scope::Read);
        assert_eq!(Operation::ManageTenant.required_scope(), Scope::Admin);
        assert_eq!(Operation::ReadAudit.to_string(), "read_audit");
    }
}
