//! # strongbox-engine
//!
//! The Strongbox façade. [`Engine`] wires the envelope crypto, versioned
//! store, tiered cache, rotation manager and audit ledger together, and puts
//! authorization and auditing in front of every operation.

pub mod authz;
pub mod engine;
pub mod hook;

pub use authz::{AllowAll, Authorizer, Decision, Grant, Operation, Scope, ScopedAuthorizer};
pub use engine::{CommittedWrite, Engine, EngineBuilder, ResolvedValue};
pub use hook::AuditCommitHook;
