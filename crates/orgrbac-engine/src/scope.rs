//! Scope resolution: Organization selector to target namespaces

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use orgrbac_common::crd::{LabelSelector, Organization};
use orgrbac_common::{ObjectStore, Result, CLUSTER_LABEL, ORGANIZATION_LABEL};
use tracing::debug;

/// A namespace in scope together with the labels the subject filter needs
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeNamespace {
    /// Organization the namespace belongs to
    pub organization: String,
    /// Namespace labels at resolution time
    pub labels: BTreeMap<String, String>,
}

/// Whether a namespace is being deleted
pub fn is_terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
        || ns
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Terminating")
}

/// Selector for the cluster namespaces of an organization
pub fn cluster_namespace_selector(organization: &str) -> LabelSelector {
    LabelSelector::label_eq(ORGANIZATION_LABEL, organization).and_exists(CLUSTER_LABEL)
}

/// Resolve a selector into the namespace names in scope
pub async fn resolve_scope<S: ObjectStore>(
    store: &S,
    object: &str,
    selector: &LabelSelector,
) -> Result<BTreeSet<String>> {
    Ok(resolve_scope_namespaces(store, object, selector)
        .await?
        .into_keys()
        .collect())
}

/// Resolve a selector into the namespaces in scope, keyed by name
///
/// `object` names the resource owning the selector and is used in
/// validation errors. Terminating namespaces and organization namespaces
/// that do not exist yet are left out.
pub async fn resolve_scope_namespaces<S: ObjectStore>(
    store: &S,
    object: &str,
    selector: &LabelSelector,
) -> Result<BTreeMap<String, ScopeNamespace>> {
    selector.validate(object, "spec.scope.organizationSelector")?;

    let organizations: Vec<Organization> = store.list(None, selector).await?;
    let mut resolved = BTreeMap::new();

    for org in &organizations {
        let org_name = org.name_any();
        let Some(org_ns) = org.owned_namespace() else {
            debug!(organization = %org_name, "organization has no namespace yet, skipping");
            continue;
        };

        match store.get::<Namespace>(None, org_ns).await? {
            Some(ns) if !is_terminating(&ns) => {
                resolved.insert(
                    org_ns.to_string(),
                    ScopeNamespace {
                        organization: org_name.clone(),
                        labels: ns.labels().clone(),
                    },
                );
            }
            Some(_) => debug!(namespace = %org_ns, "organization namespace terminating, skipping"),
            None => debug!(namespace = %org_ns, "organization namespace not found, skipping"),
        }

        let cluster_namespaces: Vec<Namespace> = store
            .list(None, &cluster_namespace_selector(&org_name))
            .await?;
        for ns in cluster_namespaces.iter().filter(|ns| !is_terminating(ns)) {
            resolved.insert(
                ns.name_any(),
                ScopeNamespace {
                    organization: org_name.clone(),
                    labels: ns.labels().clone(),
                },
            );
        }
    }

    debug!(
        object = %object,
        organizations = organizations.len(),
        namespaces = resolved.len(),
        "resolved scope"
    );
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgrbac_common::fixtures::*;
    use orgrbac_common::store::MemoryStore;
    use orgrbac_common::Error;

    #[tokio::test]
    async fn selector_resolves_org_and_cluster_namespaces() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &["c1", "c2"]);
        seed_org(&store, "globex", &[("tier", "silver")], &["c3"]);

        let scope = resolve_scope(&store, "t", &LabelSelector::label_eq("tier", "gold"))
            .await
            .unwrap();
        assert_eq!(
            scope,
            BTreeSet::from(["c1".to_string(), "c2".to_string(), "org-acme".to_string()])
        );

        let everything = resolve_scope(&store, "t", &LabelSelector::default())
            .await
            .unwrap();
        assert_eq!(everything.len(), 5);
    }

    #[tokio::test]
    async fn no_matching_organization_is_an_empty_scope() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &["c1"]);

        let scope = resolve_scope(&store, "t", &LabelSelector::label_eq("tier", "bronze"))
            .await
            .unwrap();
        assert!(scope.is_empty());
    }

    #[tokio::test]
    async fn terminating_namespaces_are_excluded() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[], &["c1", "c2"]);
        let mut dying = cluster_namespace("c2", "acme");
        dying.status = Some(k8s_openapi::api::core::v1::NamespaceStatus {
            phase: Some("Terminating".to_string()),
            ..Default::default()
        });
        store.insert(&dying);

        let scope = resolve_scope(&store, "t", &LabelSelector::default())
            .await
            .unwrap();
        assert_eq!(scope, BTreeSet::from(["c1".to_string(), "org-acme".to_string()]));
    }

    #[tokio::test]
    async fn organizations_without_a_namespace_are_skipped() {
        let store = MemoryStore::new();
        store.insert(&organization("pending", &[], None));

        let scope = resolve_scope(&store, "t", &LabelSelector::default())
            .await
            .unwrap();
        assert!(scope.is_empty());
    }

    #[tokio::test]
    async fn namespaces_without_cluster_label_are_not_cluster_namespaces() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[], &[]);
        store.insert(&namespace("acme-scratch", &[(ORGANIZATION_LABEL, "acme")]));

        let scope = resolve_scope(&store, "t", &LabelSelector::default())
            .await
            .unwrap();
        assert_eq!(scope, BTreeSet::from(["org-acme".to_string()]));
    }

    #[tokio::test]
    async fn malformed_selector_is_fatal_before_any_read() {
        let store = MemoryStore::new();
        let mut selector = LabelSelector::default();
        selector
            .match_expressions
            .push(orgrbac_common::crd::LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: orgrbac_common::crd::LabelSelectorOperator::In,
                values: vec![],
            });

        let err = resolve_scope(&store, "admins", &selector).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.is_retryable());
    }
}
