//! RBAC propagation and RoleBindingTemplate materialization
//!
//! Everything here works against an [`ObjectStore`](orgrbac_common::ObjectStore)
//! and re-derives the complete desired state on every pass. The operator
//! crate only wires these engines to watch events.

#![deny(missing_docs)]

pub mod materializer;
pub mod propagation;
pub mod protected;
pub mod reconcile;
pub mod scope;

pub use materializer::{MaterializeOutcome, TemplateMaterializer};
pub use propagation::{PropagationReport, PropagationRule, SubjectPropagator, PROPAGATION_RULES};
pub use protected::ProtectedNamespaces;
pub use reconcile::{
    delete_owned, ensure, ensure_shared, CleanupFailure, CleanupReport, DeleteOutcome, Outcome,
    Reconcilable,
};
pub use scope::{resolve_scope, resolve_scope_namespaces, ScopeNamespace};
