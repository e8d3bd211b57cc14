//! RoleBindingTemplate materialization
//!
//! Each pass resolves the template's scope, writes the derived binding into
//! every namespace in scope, removes bindings from namespaces that left it,
//! and records the result in the template status.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use orgrbac_common::crd::{
    Condition, ConditionStatus, FailedNamespace, RoleBindingTemplate, RoleBindingTemplateStatus,
    TemplatePhase, CONDITION_READY,
};
use orgrbac_common::store::object_ref;
use orgrbac_common::{
    Error, ObjectStore, OperatorConfig, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    NOTES_ANNOTATION, TEMPLATE_LABEL,
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::protected::ProtectedNamespaces;
use crate::reconcile::{delete_owned, ensure, CleanupReport, DeleteOutcome};
use crate::scope::resolve_scope_namespaces;

/// Reason recorded for namespaces whose binding could not be written
const RECONCILE_FAILED_REASON: &str = "failed to reconcile derived RoleBinding";

/// Result of a successful materialization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeOutcome {
    /// Namespaces holding the derived binding (or needing none), sorted
    pub provisioned: Vec<String>,
    /// Namespaces whose binding was removed because they left scope
    pub removed: Vec<String>,
    /// Whether the template status was written
    pub status_written: bool,
}

/// Materializes RoleBindingTemplates into namespaces
#[derive(Debug, Clone)]
pub struct TemplateMaterializer {
    protected: ProtectedNamespaces,
    max_conflict_retries: u32,
}

impl TemplateMaterializer {
    /// Create a materializer
    pub fn new(protected: ProtectedNamespaces, max_conflict_retries: u32) -> Self {
        Self {
            protected,
            max_conflict_retries,
        }
    }

    /// Build the materializer from operator configuration
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self::new(
            ProtectedNamespaces::from_config(config),
            config.max_conflict_retries,
        )
    }

    /// The binding `template` derives in `namespace`, subjects unfiltered
    pub fn desired_binding(&self, template: &RoleBindingTemplate, namespace: &str) -> Result<RoleBinding> {
        let template_name = template.name_any();
        let owner = owner_reference(template)?;
        let meta = &template.spec.template.metadata;

        let mut labels = meta.labels.clone();
        labels
            .entry(MANAGED_BY_LABEL.to_string())
            .or_insert_with(|| MANAGED_BY_VALUE.to_string());
        labels
            .entry(TEMPLATE_LABEL.to_string())
            .or_insert_with(|| template_name.clone());

        let mut annotations = meta.annotations.clone();
        annotations
            .entry(NOTES_ANNOTATION.to_string())
            .or_insert_with(|| format!("Generated based on RoleBindingTemplate {}", template_name));

        Ok(RoleBinding {
            metadata: ObjectMeta {
                name: Some(template.binding_name()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            role_ref: template.spec.template.role_ref.to_role_ref(),
            subjects: Some(
                template
                    .spec
                    .template
                    .subjects
                    .iter()
                    .map(|s| s.to_subject(namespace))
                    .collect(),
            ),
        })
    }

    /// Run one materialization pass
    ///
    /// Per-namespace failures never abort the pass; they end up in
    /// `status.failedNamespaces` and the pass returns [`Error::Partial`].
    #[instrument(skip(self, store, template), fields(template = %template.name_any()))]
    pub async fn materialize<S: ObjectStore>(
        &self,
        store: &S,
        template: &RoleBindingTemplate,
    ) -> Result<MaterializeOutcome> {
        let name = template.name_any();
        let generation = template.metadata.generation;
        let current = template.status.clone().unwrap_or_default();
        let mut status_written = false;

        if generation.is_some() && current.observed_generation != generation {
            let progressing = RoleBindingTemplateStatus {
                phase: TemplatePhase::Progressing,
                conditions: vec![ready_condition(
                    &current,
                    ConditionStatus::Unknown,
                    "Progressing",
                    "materializing new generation",
                )],
                ..current.clone()
            };
            status_written |= write_status(store, &name, &current, &progressing).await?;
        }

        if let Err(e) = template.spec.validate(&name) {
            self.fail(store, &name, &current, generation, &e).await?;
            return Err(e);
        }

        let scope = match resolve_scope_namespaces(
            store,
            &name,
            &template.spec.scope.organization_selector,
        )
        .await
        {
            Ok(scope) => scope,
            Err(e @ Error::Validation { .. }) => {
                self.fail(store, &name, &current, generation, &e).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let binding_name = template.binding_name();
        let owner_uid = template.uid().unwrap_or_default();
        let mut provisioned = BTreeSet::new();
        let mut failed: BTreeMap<String, String> = BTreeMap::new();
        let mut removed = Vec::new();

        // Namespaces recorded by earlier passes (including ones that failed)
        // that are no longer in scope
        let previous: BTreeSet<&str> = current
            .provisioned_namespaces
            .iter()
            .map(String::as_str)
            .chain(current.failed_namespaces.iter().map(|f| f.namespace.as_str()))
            .collect();
        for ns in previous.into_iter().filter(|ns| !scope.contains_key(*ns)) {
            match delete_owned::<_, RoleBinding>(store, Some(ns), &binding_name, &owner_uid).await {
                Ok(DeleteOutcome::Deleted) => removed.push(ns.to_string()),
                Ok(_) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(namespace = %ns, error = %e, "failed to remove binding from namespace that left scope");
                    failed.insert(ns.to_string(), RECONCILE_FAILED_REASON.to_string());
                }
            }
        }

        for (ns, info) in &scope {
            let mut desired = self.desired_binding(template, ns)?;
            let subjects = self.protected.filter(
                desired.subjects.as_deref().unwrap_or_default(),
                ns,
                &info.labels,
            );

            let result = if subjects.is_empty() {
                // nothing may be granted here; the namespace still counts as provisioned
                debug!(namespace = %ns, "no subjects left after filtering");
                delete_owned::<_, RoleBinding>(store, Some(ns), &binding_name, &owner_uid)
                    .await
                    .map(|_| ())
            } else {
                desired.subjects = Some(subjects);
                ensure(store, &desired, self.max_conflict_retries)
                    .await
                    .map(|_| ())
            };

            match result {
                Ok(()) => {
                    provisioned.insert(ns.clone());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(namespace = %ns, error = %e, "failed to reconcile derived binding");
                    let reason = match &e {
                        Error::Ownership { .. } => e.to_string(),
                        _ => RECONCILE_FAILED_REASON.to_string(),
                    };
                    failed.insert(ns.clone(), reason);
                }
            }
        }

        let (phase, ready) = if failed.is_empty() {
            (
                TemplatePhase::Succeeded,
                ready_condition(
                    &current,
                    ConditionStatus::True,
                    "Succeeded",
                    &format!("binding present in {} namespaces", provisioned.len()),
                ),
            )
        } else {
            (
                TemplatePhase::Failed,
                ready_condition(
                    &current,
                    ConditionStatus::False,
                    "Failed",
                    &format!("binding failed in {} namespaces", failed.len()),
                ),
            )
        };
        let desired_status = RoleBindingTemplateStatus {
            phase,
            provisioned_namespaces: provisioned.iter().cloned().collect(),
            failed_namespaces: failed
                .iter()
                .map(|(namespace, reason)| FailedNamespace {
                    namespace: namespace.clone(),
                    reason: reason.clone(),
                })
                .collect(),
            conditions: vec![ready],
            observed_generation: generation,
        };
        status_written |= write_status(store, &name, &current, &desired_status).await?;

        if !failed.is_empty() {
            return Err(Error::Partial {
                context: format!("rolebindingtemplate {}", name),
                failed: failed.into_keys().collect(),
            });
        }

        info!(
            provisioned = provisioned.len(),
            removed = removed.len(),
            "template materialized"
        );
        Ok(MaterializeOutcome {
            provisioned: provisioned.into_iter().collect(),
            removed,
            status_written,
        })
    }

    /// Remove every binding the template derived
    ///
    /// Best effort over all recorded namespaces; the caller removes the
    /// finalizer regardless of the report.
    #[instrument(skip(self, store, template), fields(template = %template.name_any()))]
    pub async fn cleanup<S: ObjectStore>(&self, store: &S, template: &RoleBindingTemplate) -> CleanupReport {
        let binding_name = template.binding_name();
        let owner_uid = template.uid().unwrap_or_default();
        let status = template.status.clone().unwrap_or_default();

        let namespaces: BTreeSet<&str> = status
            .provisioned_namespaces
            .iter()
            .map(String::as_str)
            .chain(status.failed_namespaces.iter().map(|f| f.namespace.as_str()))
            .collect();

        let mut report = CleanupReport::default();
        for ns in namespaces {
            let result = delete_owned::<_, RoleBinding>(store, Some(ns), &binding_name, &owner_uid).await;
            report.record(object_ref(Some(ns), &binding_name), result);
        }
        info!(
            removed = report.removed.len(),
            failures = report.failures.len(),
            "template cleanup finished"
        );
        report
    }

    async fn fail<S: ObjectStore>(
        &self,
        store: &S,
        name: &str,
        current: &RoleBindingTemplateStatus,
        generation: Option<i64>,
        error: &Error,
    ) -> Result<()> {
        let failed = RoleBindingTemplateStatus {
            phase: TemplatePhase::Failed,
            conditions: vec![ready_condition(
                current,
                ConditionStatus::False,
                "InvalidSpec",
                &error.to_string(),
            )],
            observed_generation: generation,
            ..current.clone()
        };
        write_status(store, name, current, &failed).await.map(|_| ())
    }
}

fn owner_reference(template: &RoleBindingTemplate) -> Result<OwnerReference> {
    template.controller_owner_ref(&()).ok_or_else(|| {
        Error::validation_for(
            template.name_any(),
            "template has no uid, cannot own derived bindings",
        )
    })
}

/// Ready condition keeping the previous transition time when the state is unchanged
fn ready_condition(
    current: &RoleBindingTemplateStatus,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> Condition {
    let next = Condition::new(CONDITION_READY, status, reason, message);
    match current.conditions.iter().find(|c| c.type_ == CONDITION_READY) {
        Some(existing) if existing.same_state(&next) => existing.clone(),
        _ => next,
    }
}

fn status_matches(a: &RoleBindingTemplateStatus, b: &RoleBindingTemplateStatus) -> bool {
    a.phase == b.phase
        && a.provisioned_namespaces == b.provisioned_namespaces
        && a.failed_namespaces == b.failed_namespaces
        && a.observed_generation == b.observed_generation
        && a.conditions.len() == b.conditions.len()
        && a.conditions.iter().zip(&b.conditions).all(|(x, y)| x.same_state(y))
}

/// Write `desired` unless it equals `current`; returns whether a write happened
async fn write_status<S: ObjectStore>(
    store: &S,
    name: &str,
    current: &RoleBindingTemplateStatus,
    desired: &RoleBindingTemplateStatus,
) -> Result<bool> {
    if status_matches(current, desired) {
        debug!(template = %name, "status unchanged, skipping update");
        return Ok(false);
    }
    store
        .merge_patch_status::<RoleBindingTemplate>(None, name, &json!({ "status": desired }))
        .await?;
    debug!(template = %name, phase = %desired.phase, "status updated");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgrbac_common::crd::{LabelSelector, SubjectKind};
    use orgrbac_common::fixtures::*;
    use orgrbac_common::store::{InjectedError, MemoryStore, StoreOp};
    use orgrbac_common::{ObjectKind, RBAC_API_GROUP};

    fn materializer() -> TemplateMaterializer {
        TemplateMaterializer::new(
            ProtectedNamespaces::new(["giantswarm", "kube-system"], "giantswarm"),
            3,
        )
    }

    fn seeded_template(store: &MemoryStore, subjects: Vec<orgrbac_common::crd::TemplateSubject>) -> RoleBindingTemplate {
        store.insert(&template(
            "admins",
            "cluster-admin",
            subjects,
            LabelSelector::label_eq("tier", "gold"),
        ))
    }

    fn latest(store: &MemoryStore) -> RoleBindingTemplate {
        store.peek(None, "admins").unwrap()
    }

    #[tokio::test]
    async fn binding_lands_in_every_namespace_in_scope() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &["c1"]);
        seed_org(&store, "globex", &[("tier", "silver")], &["c2"]);
        let t = seeded_template(&store, vec![template_subject(SubjectKind::Group, "admins", None)]);

        let outcome = materializer().materialize(&store, &t).await.unwrap();
        assert_eq!(outcome.provisioned, vec!["c1", "org-acme"]);

        let rb: RoleBinding = store.peek(Some("c1"), "admins").unwrap();
        assert_eq!(rb.role_ref.api_group, RBAC_API_GROUP);
        assert_eq!(rb.labels().get(TEMPLATE_LABEL).map(String::as_str), Some("admins"));
        assert_eq!(
            rb.annotations().get(NOTES_ANNOTATION).map(String::as_str),
            Some("Generated based on RoleBindingTemplate admins")
        );
        assert!(store.peek::<RoleBinding>(Some("c2"), "admins").is_none());

        let status = latest(&store).status.unwrap();
        assert_eq!(status.phase, TemplatePhase::Succeeded);
        assert_eq!(status.provisioned_namespaces, vec!["c1", "org-acme"]);
        assert_eq!(status.observed_generation, Some(1));
    }

    #[tokio::test]
    async fn unqualified_service_account_is_scoped_to_each_namespace() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &["c1"]);
        let t = seeded_template(
            &store,
            vec![template_subject(SubjectKind::ServiceAccount, "deployer", None)],
        );
        materializer().materialize(&store, &t).await.unwrap();

        for ns in ["c1", "org-acme"] {
            let rb: RoleBinding = store.peek(Some(ns), "admins").unwrap();
            assert_eq!(rb.subjects.unwrap()[0].namespace.as_deref(), Some(ns));
        }
    }

    #[tokio::test]
    async fn converged_template_is_not_rewritten() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &["c1"]);
        let t = seeded_template(&store, vec![template_subject(SubjectKind::Group, "admins", None)]);
        materializer().materialize(&store, &t).await.unwrap();

        store.reset_writes();
        let outcome = materializer().materialize(&store, &latest(&store)).await.unwrap();
        assert!(!outcome.status_written);
        assert_eq!(store.total_writes(), 0);
    }

    #[tokio::test]
    async fn namespaces_leaving_scope_lose_the_binding() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &["c1", "c2"]);
        let t = seeded_template(&store, vec![template_subject(SubjectKind::Group, "admins", None)]);
        materializer().materialize(&store, &t).await.unwrap();

        store.touch::<k8s_openapi::api::core::v1::Namespace>(None, "c2", |v| {
            v["metadata"]["labels"] = json!({});
        });
        let outcome = materializer().materialize(&store, &latest(&store)).await.unwrap();
        assert_eq!(outcome.removed, vec!["c2"]);
        assert!(store.peek::<RoleBinding>(Some("c2"), "admins").is_none());
        assert_eq!(
            latest(&store).status.unwrap().provisioned_namespaces,
            vec!["c1", "org-acme"]
        );
    }

    #[tokio::test]
    async fn empty_subject_namespace_counts_as_provisioned() {
        let store = MemoryStore::new();
        seed_org(&store, "giantswarm", &[("tier", "gold")], &[]);
        store.insert(&namespace(
            "org-giantswarm",
            &[
                (orgrbac_common::ORGANIZATION_LABEL, "giantswarm"),
                (orgrbac_common::PROTECTED_NAMESPACE_LABEL, "true"),
            ],
        ));
        let t = seeded_template(&store, vec![template_subject(SubjectKind::Group, "admins", None)]);

        let outcome = materializer().materialize(&store, &t).await.unwrap();
        assert_eq!(outcome.provisioned, vec!["org-giantswarm"]);
        assert!(store.peek::<RoleBinding>(Some("org-giantswarm"), "admins").is_none());
        let status = latest(&store).status.unwrap();
        assert!(status.failed_namespaces.is_empty());
        assert_eq!(status.phase, TemplatePhase::Succeeded);
    }

    #[tokio::test]
    async fn per_namespace_failure_is_reported_and_others_proceed() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &["c1", "c2"]);
        store.fail_always(ObjectKind::RoleBinding, StoreOp::Create, Some("c1"), InjectedError::Unavailable);
        let t = seeded_template(&store, vec![template_subject(SubjectKind::Group, "admins", None)]);

        let err = materializer().materialize(&store, &t).await.unwrap_err();
        match &err {
            Error::Partial { failed, .. } => assert_eq!(failed, &vec!["c1".to_string()]),
            other => panic!("Expected Partial, got {:?}", other),
        }
        assert!(err.is_retryable());

        let status = latest(&store).status.unwrap();
        assert_eq!(status.phase, TemplatePhase::Failed);
        assert_eq!(status.provisioned_namespaces, vec!["c2", "org-acme"]);
        assert_eq!(status.failed_namespaces[0].namespace, "c1");
        assert_eq!(status.failed_namespaces[0].reason, RECONCILE_FAILED_REASON);

        store.clear_faults();
        materializer().materialize(&store, &latest(&store)).await.unwrap();
        let status = latest(&store).status.unwrap();
        assert_eq!(status.phase, TemplatePhase::Succeeded);
        assert!(status.failed_namespaces.is_empty());
    }

    #[tokio::test]
    async fn foreign_binding_is_reported_with_its_owner() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &[]);
        let mut foreign = cluster_role_binding("org-acme", "admins", "view", vec![user("x")]);
        foreign.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "RoleBindingTemplate".to_string(),
            name: "other".to_string(),
            uid: "uid-other".to_string(),
            controller: Some(true),
            block_owner_deletion: None,
        }]);
        store.insert(&foreign);
        let t = seeded_template(&store, vec![template_subject(SubjectKind::Group, "admins", None)]);

        assert!(materializer().materialize(&store, &t).await.is_err());
        let status = latest(&store).status.unwrap();
        assert!(status.failed_namespaces[0].reason.contains("RoleBindingTemplate/other"));
        let untouched: RoleBinding = store.peek(Some("org-acme"), "admins").unwrap();
        assert_eq!(untouched.role_ref.name, "view");
    }

    #[tokio::test]
    async fn invalid_selector_fails_without_writing_bindings() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &[]);
        let mut t = template(
            "admins",
            "cluster-admin",
            vec![template_subject(SubjectKind::Group, "admins", None)],
            LabelSelector::default(),
        );
        t.spec.scope.organization_selector.match_expressions.push(
            orgrbac_common::crd::LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: orgrbac_common::crd::LabelSelectorOperator::Exists,
                values: vec!["gold".to_string()],
            },
        );
        let t = store.insert(&t);

        let err = materializer().materialize(&store, &t).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.writes(ObjectKind::RoleBinding), 0);
        assert_eq!(latest(&store).status.unwrap().phase, TemplatePhase::Failed);
    }

    #[tokio::test]
    async fn cleanup_removes_only_owned_bindings() {
        let store = MemoryStore::new();
        seed_org(&store, "acme", &[("tier", "gold")], &["c1"]);
        let t = seeded_template(&store, vec![template_subject(SubjectKind::Group, "admins", None)]);
        materializer().materialize(&store, &t).await.unwrap();

        let report = materializer().cleanup(&store, &latest(&store)).await;
        assert!(report.is_clean());
        assert_eq!(report.removed, vec!["c1/admins", "org-acme/admins"]);
        assert!(store.all::<RoleBinding>().is_empty());
    }
}
