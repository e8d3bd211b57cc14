//! Common types for orgrbac: CRDs, errors, configuration and the object store

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures;
pub mod kind_registry;
pub mod store;
pub mod telemetry;

pub use config::{ConfigSource, OperatorConfig, OsEnvConfig};
pub use error::Error;
pub use kind_registry::{KindRegistry, ObjectKind};
pub use store::{CancellableStore, KubeStore, ObjectStore, StoreObject};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of Kubernetes RBAC objects
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Label marking a namespace as belonging to an organization (value: organization name)
pub const ORGANIZATION_LABEL: &str = "giantswarm.io/organization";

/// Label marking a namespace as a workload cluster namespace (value: cluster name)
pub const CLUSTER_LABEL: &str = "giantswarm.io/cluster";

/// Label marking a namespace as protected from tenant-origin subjects
pub const PROTECTED_NAMESPACE_LABEL: &str = "giantswarm.io/protected-namespace";

/// Label put on every object derived by the operator
pub const MANAGED_BY_LABEL: &str = "giantswarm.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on derived objects
pub const MANAGED_BY_VALUE: &str = "rbac-operator";

/// Label naming the RoleBindingTemplate a derived binding was materialized from
pub const TEMPLATE_LABEL: &str = "auth.giantswarm.io/role-binding-template";

/// Label naming the Organization a propagated object was derived for
pub const PROPAGATED_FOR_LABEL: &str = "auth.giantswarm.io/propagated-for";

/// Annotation carrying a human-readable note on derived objects
pub const NOTES_ANNOTATION: &str = "giantswarm.io/notes";

/// Finalizer that lets the template controller remove derived bindings
pub const TEMPLATE_FINALIZER: &str = "auth.giantswarm.io/rolebindingtemplate-cleanup";

/// Finalizer that lets the organization controller remove propagated objects
pub const ORGANIZATION_FINALIZER: &str = "security.giantswarm.io/org-permissions-cleanup";

/// Field manager used for patches
pub const FIELD_MANAGER: &str = "orgrbac-operator";
