//! Organization controller

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use orgrbac_common::crd::Organization;
use orgrbac_common::{Error, ObjectStore, Result, ORGANIZATION_FINALIZER, ORGANIZATION_LABEL};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{add_finalizer, remove_finalizer};
use crate::Context;

/// Reconcile one Organization
///
/// Labels the organization namespace and propagates the subjects bound in it
/// into the cluster namespaces and the platform namespace. Deletion removes
/// everything propagated before the finalizer is dropped.
#[instrument(skip(org, ctx), fields(organization = %org.name_any()))]
pub async fn reconcile<S: ObjectStore>(
    org: Arc<Organization>,
    ctx: Arc<Context<S>>,
) -> std::result::Result<Action, Error> {
    let store = ctx.pass_store();

    if org.metadata.deletion_timestamp.is_some() {
        let report = ctx.propagator.cleanup_organization(&store, &org).await;
        if !report.is_clean() {
            warn!(
                failures = report.failures.len(),
                "removing finalizer with propagated objects left behind"
            );
        }
        remove_finalizer(&store, org.as_ref(), ORGANIZATION_FINALIZER).await?;
        info!(removed = report.removed.len(), "organization deleted");
        return Ok(Action::await_change());
    }

    add_finalizer(&store, org.as_ref(), ORGANIZATION_FINALIZER).await?;
    if let Some(ns) = org.owned_namespace() {
        label_organization_namespace(&store, &org.name_any(), ns).await?;
    }
    let report = ctx.propagator.propagate(&store, &org).await?;
    info!(
        written = report.written.len(),
        unchanged = report.unchanged,
        removed = report.removed.len(),
        "organization reconciled"
    );
    Ok(Action::requeue(ctx.config.requeue_interval))
}

/// Make sure the organization namespace carries the organization label
///
/// Returns whether a patch was sent. A namespace that does not exist yet is
/// left alone; its creation triggers another pass.
pub async fn label_organization_namespace<S: ObjectStore>(
    store: &S,
    organization: &str,
    namespace: &str,
) -> Result<bool> {
    let Some(ns) = store.get::<Namespace>(None, namespace).await? else {
        debug!(namespace, "organization namespace not found yet");
        return Ok(false);
    };
    if ns.labels().get(ORGANIZATION_LABEL).map(String::as_str) == Some(organization) {
        return Ok(false);
    }
    store
        .merge_patch::<Namespace>(
            None,
            namespace,
            &json!({"metadata": {"labels": {ORGANIZATION_LABEL: organization}}}),
        )
        .await?;
    info!(namespace, "labeled organization namespace");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
    use orgrbac_common::fixtures::*;
    use orgrbac_common::store::{MemoryStore, StoreOp};
    use orgrbac_common::{ObjectKind, OperatorConfig};
    use tokio_util::sync::CancellationToken;

    fn context(store: MemoryStore) -> Arc<Context<MemoryStore>> {
        Arc::new(Context::new(
            store,
            OperatorConfig::default(),
            CancellationToken::new(),
        ))
    }

    /// Story: an unlabeled organization namespace gets labeled once
    #[tokio::test]
    async fn story_organization_namespace_is_labeled() {
        let store = MemoryStore::new();
        store.insert(&namespace("org-acme", &[]));
        assert!(label_organization_namespace(&store, "acme", "org-acme")
            .await
            .unwrap());

        let ns: Namespace = store.peek(None, "org-acme").unwrap();
        assert_eq!(
            ns.labels().get(ORGANIZATION_LABEL).map(String::as_str),
            Some("acme")
        );

        store.reset_writes();
        assert!(!label_organization_namespace(&store, "acme", "org-acme")
            .await
            .unwrap());
        assert_eq!(store.total_writes(), 0);
    }

    /// Story: a missing organization namespace is not an error
    #[tokio::test]
    async fn story_missing_namespace_is_skipped() {
        let store = MemoryStore::new();
        assert!(!label_organization_namespace(&store, "acme", "org-acme")
            .await
            .unwrap());
    }

    /// Story: a full pass labels, adds the finalizer and propagates
    #[tokio::test]
    async fn story_organization_pass_propagates() {
        let store = MemoryStore::new();
        store.insert(&namespace("org-acme", &[]));
        store.insert(&cluster_namespace("c1", "acme"));
        store.insert(&cluster_role_binding(
            "org-acme",
            "readers",
            "read-all",
            vec![group("readers")],
        ));
        let org = store.insert(&organization("acme", &[], Some("org-acme")));
        let ctx = context(store);

        let action = reconcile(Arc::new(org), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(ctx.config.requeue_interval));

        let stored: Organization = ctx.store.peek(None, "acme").unwrap();
        assert!(stored
            .finalizers()
            .contains(&ORGANIZATION_FINALIZER.to_string()));
        assert_eq!(ctx.store.writes_of(ObjectKind::Namespace, StoreOp::Patch), 1);
        let derived: RoleBinding = ctx.store.peek(Some("c1"), "read-in-cluster-ns").unwrap();
        assert_eq!(derived.subjects.unwrap(), vec![group("readers")]);
        assert!(ctx.store.peek::<Role>(Some("c1"), "read-in-cluster-ns").is_some());
    }

    /// Story: deleting an organization removes what was propagated for it
    #[tokio::test]
    async fn story_deleted_organization_is_cleaned_up() {
        let store = MemoryStore::new();
        let org = seed_org(&store, "acme", &[], &["c1"]);
        store.insert(&cluster_role_binding(
            "org-acme",
            "admins",
            "cluster-admin",
            vec![group("admins")],
        ));
        let ctx = context(store);
        reconcile(Arc::new(org), ctx.clone()).await.unwrap();
        assert!(ctx
            .store
            .peek::<RoleBinding>(Some("c1"), "write-in-cluster-ns")
            .is_some());

        ctx.store.delete::<Organization>(None, "acme").await.unwrap();
        let deleting: Organization = ctx.store.peek(None, "acme").unwrap();
        let action = reconcile(Arc::new(deleting), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(ctx.store.peek::<Organization>(None, "acme").is_none());
        assert!(ctx
            .store
            .peek::<RoleBinding>(Some("c1"), "write-in-cluster-ns")
            .is_none());
        assert!(ctx
            .store
            .peek::<Role>(Some("c1"), "write-in-cluster-ns")
            .is_none());
        assert!(ctx
            .store
            .peek::<RoleBinding>(Some("default"), "acme-cluster-admin-read-shared-catalogs")
            .is_none());
        assert!(ctx
            .store
            .peek::<Role>(Some("default"), "read-shared-catalogs")
            .is_some());
    }
}
