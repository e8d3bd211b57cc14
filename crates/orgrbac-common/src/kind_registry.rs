//! Registry of the object kinds orgrbac reads and writes
//!
//! The store addresses every object through a `DynamicObject` API built from
//! the `ApiResource` registered here. Built-in kinds are fixed; the two CRD
//! kinds are resolved through API discovery at startup so that a cluster
//! serving a newer storage version is still addressed correctly.

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::discovery::{ApiResource, Discovery};
use kube::Client;
use tracing::{info, warn};

use crate::crd::{Organization, RoleBindingTemplate};

/// Object kinds handled by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Namespace (core/v1)
    Namespace,
    /// Organization (security.giantswarm.io)
    Organization,
    /// RoleBindingTemplate (auth.giantswarm.io)
    RoleBindingTemplate,
    /// Role (rbac.authorization.k8s.io)
    Role,
    /// RoleBinding (rbac.authorization.k8s.io)
    RoleBinding,
}

/// All ObjectKind variants for iteration.
pub const ALL_OBJECT_KINDS: &[ObjectKind] = &[
    ObjectKind::Namespace,
    ObjectKind::Organization,
    ObjectKind::RoleBindingTemplate,
    ObjectKind::Role,
    ObjectKind::RoleBinding,
];

impl ObjectKind {
    /// API group for discovery lookup (empty for the core group)
    pub fn group(&self) -> &'static str {
        match self {
            Self::Namespace => "",
            Self::Organization => "security.giantswarm.io",
            Self::RoleBindingTemplate => "auth.giantswarm.io",
            Self::Role | Self::RoleBinding => crate::RBAC_API_GROUP,
        }
    }

    /// Kubernetes Kind string
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::Organization => "Organization",
            Self::RoleBindingTemplate => "RoleBindingTemplate",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn namespaced(&self) -> bool {
        matches!(self, Self::Role | Self::RoleBinding)
    }

    /// CRD kinds whose served version is taken from discovery
    fn discoverable(&self) -> bool {
        matches!(self, Self::Organization | Self::RoleBindingTemplate)
    }

    /// API resource compiled into this binary
    fn builtin_resource(&self) -> ApiResource {
        match self {
            Self::Namespace => ApiResource::erase::<Namespace>(&()),
            Self::Organization => ApiResource::erase::<Organization>(&()),
            Self::RoleBindingTemplate => ApiResource::erase::<RoleBindingTemplate>(&()),
            Self::Role => ApiResource::erase::<Role>(&()),
            Self::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_str())
    }
}

/// Cache of API resources per object kind.
///
/// Created once at startup and shared across controllers via `Arc<KindRegistry>`.
pub struct KindRegistry {
    entries: DashMap<ObjectKind, ApiResource>,
}

impl KindRegistry {
    /// Populate every kind with the API version compiled into this binary.
    ///
    /// Used as a fallback when API discovery fails entirely, and in tests.
    pub fn hardcoded_defaults() -> Self {
        let entries = DashMap::new();
        for kind in ALL_OBJECT_KINDS {
            entries.insert(*kind, kind.builtin_resource());
        }
        Self { entries }
    }

    /// Run API discovery for the CRD groups and populate all kinds.
    ///
    /// CRDs missing from discovery keep their compiled-in version; the
    /// RoleBindingTemplate CRD may not be installed yet when `--crd` runs
    /// in the same process.
    pub async fn discover(client: &Client) -> Self {
        let registry = Self::hardcoded_defaults();
        let groups: Vec<&str> = ALL_OBJECT_KINDS
            .iter()
            .filter(|k| k.discoverable())
            .map(|k| k.group())
            .collect();

        let discovery = match Discovery::new(client.clone()).filter(&groups).run().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "API discovery failed, falling back to compiled-in versions");
                return registry;
            }
        };

        let mut discovered = 0u32;
        for kind in ALL_OBJECT_KINDS.iter().filter(|k| k.discoverable()) {
            match find_resource(&discovery, kind.group(), kind.kind_str()) {
                Some(ar) => {
                    info!(kind = %kind, api_version = %ar.api_version, "discovered CRD version");
                    registry.entries.insert(*kind, ar);
                    discovered += 1;
                }
                None => warn!(kind = %kind, "CRD not found in API discovery"),
            }
        }
        info!(discovered, "kind registry populated");

        registry
    }

    /// API resource for a kind
    pub fn get(&self, kind: ObjectKind) -> ApiResource {
        self.entries
            .get(&kind)
            .map(|r| r.clone())
            .unwrap_or_else(|| kind.builtin_resource())
    }

    /// apiVersion string written on objects of a kind
    pub fn api_version(&self, kind: ObjectKind) -> String {
        self.get(kind).api_version
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::hardcoded_defaults()
    }
}

fn find_resource(discovery: &Discovery, group: &str, kind: &str) -> Option<ApiResource> {
    discovery
        .groups()
        .filter(|g| g.name() == group)
        .flat_map(|g| g.resources_by_stability())
        .map(|(ar, _caps)| ar)
        .find(|ar| ar.kind == kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_kind_group_and_kind_are_consistent() {
        let registry = KindRegistry::hardcoded_defaults();
        for kind in ALL_OBJECT_KINDS {
            let ar = registry.get(*kind);
            assert_eq!(ar.kind, kind.kind_str(), "{:?} kind mismatch", kind);
            assert_eq!(ar.group, kind.group(), "{:?} group mismatch", kind);
            assert!(
                ar.api_version.ends_with(&ar.version),
                "{:?}: api_version '{}' doesn't end with version '{}'",
                kind,
                ar.api_version,
                ar.version
            );
        }
    }

    #[test]
    fn hardcoded_versions_match_compiled_types() {
        let registry = KindRegistry::default();
        assert_eq!(registry.api_version(ObjectKind::Namespace), "v1");
        assert_eq!(
            registry.api_version(ObjectKind::RoleBinding),
            "rbac.authorization.k8s.io/v1"
        );
        assert_eq!(
            registry.api_version(ObjectKind::Organization),
            "security.giantswarm.io/v1alpha1"
        );
        assert_eq!(registry.get(ObjectKind::RoleBindingTemplate).plural, "rolebindingtemplates");
    }

    #[test]
    fn only_rbac_objects_are_namespaced() {
        let namespaced: Vec<_> = ALL_OBJECT_KINDS.iter().filter(|k| k.namespaced()).collect();
        assert_eq!(namespaced, vec![&ObjectKind::Role, &ObjectKind::RoleBinding]);
    }
}
