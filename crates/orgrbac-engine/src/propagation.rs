//! Subject propagation from organization namespaces
//!
//! Subjects bound to the canonical `read-all` and `cluster-admin` ClusterRoles
//! in an organization's namespace are granted matching namespaced Roles in
//! every cluster namespace of the organization, and read access to the shared
//! catalogs in the platform namespace.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use orgrbac_common::crd::{LabelSelector, Organization};
use orgrbac_common::store::object_ref;
use orgrbac_common::{
    Error, ObjectStore, OperatorConfig, Result, StoreObject, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    NOTES_ANNOTATION, PROPAGATED_FOR_LABEL, RBAC_API_GROUP,
};
use tracing::{debug, info, instrument, warn};

use crate::protected::ProtectedNamespaces;
use crate::reconcile::{delete_owned, ensure, ensure_shared, CleanupReport, DeleteOutcome, Outcome};
use crate::scope::{cluster_namespace_selector, is_terminating};

/// Where a rule's derived objects are placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    /// Every cluster namespace of the organization
    ClusterNamespaces,
    /// The shared platform namespace
    PlatformNamespace,
}

/// One row of the propagation table
#[derive(Debug)]
pub struct PropagationRule {
    /// ClusterRole whose source bindings are propagated
    pub source_role: &'static str,
    /// Name of the derived Role
    pub derived_role: &'static str,
    /// Where the derived objects live
    pub target: RuleTarget,
    /// Rules of the derived Role
    pub rules: fn() -> Vec<PolicyRule>,
}

/// Group serving the catalogs shared from the platform namespace
pub const CATALOG_API_GROUP: &str = "application.giantswarm.io";

/// The fixed propagation table
pub const PROPAGATION_RULES: &[PropagationRule] = &[
    PropagationRule {
        source_role: "read-all",
        derived_role: "read-in-cluster-ns",
        target: RuleTarget::ClusterNamespaces,
        rules: read_everything,
    },
    PropagationRule {
        source_role: "cluster-admin",
        derived_role: "write-in-cluster-ns",
        target: RuleTarget::ClusterNamespaces,
        rules: write_everything,
    },
    PropagationRule {
        source_role: "read-all",
        derived_role: "read-shared-catalogs",
        target: RuleTarget::PlatformNamespace,
        rules: read_catalogs,
    },
    PropagationRule {
        source_role: "cluster-admin",
        derived_role: "read-shared-catalogs",
        target: RuleTarget::PlatformNamespace,
        rules: read_catalogs,
    },
];

const READ_VERBS: &[&str] = &["get", "list", "watch"];

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn read_everything() -> Vec<PolicyRule> {
    vec![PolicyRule {
        api_groups: Some(strings(&["*"])),
        resources: Some(strings(&["*"])),
        verbs: strings(READ_VERBS),
        ..Default::default()
    }]
}

fn write_everything() -> Vec<PolicyRule> {
    vec![PolicyRule {
        api_groups: Some(strings(&["*"])),
        resources: Some(strings(&["*"])),
        verbs: strings(&["*"]),
        ..Default::default()
    }]
}

fn read_catalogs() -> Vec<PolicyRule> {
    vec![PolicyRule {
        api_groups: Some(strings(&[CATALOG_API_GROUP])),
        resources: Some(strings(&["catalogs", "appcatalogentries"])),
        verbs: strings(READ_VERBS),
        ..Default::default()
    }]
}

impl PropagationRule {
    /// Name of the derived binding in `namespace` for `organization`
    ///
    /// Cluster namespaces belong to exactly one organization; the platform
    /// namespace is shared, so its bindings carry the organization and source
    /// role in their name.
    pub fn binding_name(&self, organization: &str) -> String {
        match self.target {
            RuleTarget::ClusterNamespaces => self.derived_role.to_string(),
            RuleTarget::PlatformNamespace => {
                format!("{}-{}-{}", organization, self.source_role, self.derived_role)
            }
        }
    }
}

type SubjectKey = (String, String, Option<String>);

fn subject_key(subject: &Subject) -> SubjectKey {
    let namespace = if subject.kind == "ServiceAccount" {
        subject.namespace.clone()
    } else {
        None
    };
    (subject.kind.clone(), subject.name.clone(), namespace)
}

/// Union of the subjects bound to ClusterRole `source_role` in `bindings`
///
/// Unqualified service accounts are scoped to `org_namespace`. Users and
/// groups are deduplicated by kind and name alone. The result is sorted.
pub fn union_subjects(bindings: &[RoleBinding], source_role: &str, org_namespace: &str) -> Vec<Subject> {
    let mut union: BTreeMap<SubjectKey, Subject> = BTreeMap::new();
    for binding in bindings
        .iter()
        .filter(|b| b.role_ref.kind == "ClusterRole" && b.role_ref.name == source_role)
    {
        for subject in binding.subjects.iter().flatten() {
            let mut subject = subject.clone();
            if subject.kind == "ServiceAccount"
                && subject.namespace.as_deref().is_none_or(str::is_empty)
            {
                subject.namespace = Some(org_namespace.to_string());
            }
            union.entry(subject_key(&subject)).or_insert(subject);
        }
    }
    union.into_values().collect()
}

/// Result of a successful propagation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagationReport {
    /// `namespace/name` of every derived object written this pass
    pub written: Vec<String>,
    /// Derived objects that were already up to date
    pub unchanged: usize,
    /// Derived bindings removed because their subject union became empty,
    /// plus objects of terminating cluster namespaces and of namespaces that
    /// left the organization
    pub removed: Vec<String>,
}

struct Target {
    namespace: String,
    labels: BTreeMap<String, String>,
}

/// Derives Roles and RoleBindings from an organization's source bindings
#[derive(Debug, Clone)]
pub struct SubjectPropagator {
    protected: ProtectedNamespaces,
    platform_namespace: String,
    max_conflict_retries: u32,
}

impl SubjectPropagator {
    /// Create a propagator
    pub fn new(
        protected: ProtectedNamespaces,
        platform_namespace: impl Into<String>,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            protected,
            platform_namespace: platform_namespace.into(),
            max_conflict_retries,
        }
    }

    /// Build the propagator from operator configuration
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self::new(
            ProtectedNamespaces::from_config(config),
            config.platform_namespace.clone(),
            config.max_conflict_retries,
        )
    }

    /// Run one propagation pass for an organization
    ///
    /// Per-target failures do not stop the pass; they are collected and
    /// returned as [`Error::Partial`].
    #[instrument(skip(self, store, org), fields(organization = %org.name_any()))]
    pub async fn propagate<S: ObjectStore>(
        &self,
        store: &S,
        org: &Organization,
    ) -> Result<PropagationReport> {
        let org_name = org.name_any();
        let Some(org_ns) = org.owned_namespace() else {
            debug!("organization has no namespace yet, nothing to propagate");
            return Ok(PropagationReport::default());
        };
        let owner = org.controller_owner_ref(&()).ok_or_else(|| {
            Error::validation_for(&org_name, "organization has no uid, cannot own derived objects")
        })?;

        let sources: Vec<RoleBinding> = store.list(Some(org_ns), &LabelSelector::default()).await?;

        let namespaces: Vec<Namespace> = store
            .list(None, &cluster_namespace_selector(&org_name))
            .await?;
        let (terminating, live): (Vec<_>, Vec<_>) =
            namespaces.into_iter().partition(is_terminating);

        let mut report = PropagationReport::default();
        let mut failures = CleanupReport::default();

        for ns in &terminating {
            let cleanup = self.cleanup_namespace(store, org, &ns.name_any()).await;
            report.removed.extend(cleanup.removed.iter().cloned());
            failures.merge(CleanupReport {
                failures: cleanup.failures,
                ..Default::default()
            });
        }

        let handled: BTreeSet<String> = live
            .iter()
            .chain(&terminating)
            .map(|ns| ns.name_any())
            .collect();
        let stale = self.remove_stale(store, org, &handled).await?;
        report.removed.extend(stale.removed.iter().cloned());
        failures.merge(CleanupReport {
            failures: stale.failures,
            ..Default::default()
        });

        let cluster_targets: Vec<Target> = live
            .iter()
            .map(|ns| Target {
                namespace: ns.name_any(),
                labels: ns.labels().clone(),
            })
            .collect();
        let platform_target = match store
            .get::<Namespace>(None, &self.platform_namespace)
            .await
        {
            Ok(ns) => Target {
                namespace: self.platform_namespace.clone(),
                labels: ns.map(|ns| ns.labels().clone()).unwrap_or_default(),
            },
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                failures.record_failure(self.platform_namespace.clone(), &e);
                Target {
                    namespace: self.platform_namespace.clone(),
                    labels: BTreeMap::new(),
                }
            }
        };

        let mut shared_roles_done = BTreeSet::new();
        for rule in PROPAGATION_RULES {
            let subjects = union_subjects(&sources, rule.source_role, org_ns);
            let targets = match rule.target {
                RuleTarget::ClusterNamespaces => cluster_targets.iter().collect::<Vec<_>>(),
                RuleTarget::PlatformNamespace => vec![&platform_target],
            };

            for target in targets {
                let role = derived_role(rule, &target.namespace, &org_name);
                let role_ref = object_ref(Some(&target.namespace), rule.derived_role);
                let role_result = match rule.target {
                    RuleTarget::ClusterNamespaces => {
                        let mut role = role;
                        role.metadata.owner_references = Some(vec![owner.clone()]);
                        ensure(store, &role, self.max_conflict_retries).await
                    }
                    RuleTarget::PlatformNamespace => {
                        if !shared_roles_done.insert(rule.derived_role) {
                            Ok(Outcome::Unchanged)
                        } else {
                            ensure_shared(store, &role, self.max_conflict_retries).await
                        }
                    }
                };
                match role_result {
                    Ok(outcome) => tally(&mut report, role_ref, outcome),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        failures.record_failure(role_ref, &e);
                        continue;
                    }
                }

                let filtered = self
                    .protected
                    .filter(&subjects, &target.namespace, &target.labels);
                let binding_name = rule.binding_name(&org_name);
                let binding_ref = object_ref(Some(&target.namespace), &binding_name);

                if filtered.is_empty() {
                    let result = delete_owned::<_, RoleBinding>(
                        store,
                        Some(&target.namespace),
                        &binding_name,
                        owner.uid.as_str(),
                    )
                    .await;
                    match result {
                        Ok(DeleteOutcome::Deleted) => report.removed.push(binding_ref),
                        Ok(_) => {}
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => failures.record_failure(binding_ref, &e),
                    }
                    continue;
                }

                let mut binding = derived_binding(rule, &target.namespace, &org_name, filtered);
                binding.metadata.owner_references = Some(vec![owner.clone()]);
                match ensure(store, &binding, self.max_conflict_retries).await {
                    Ok(outcome) => tally(&mut report, binding_ref, outcome),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => failures.record_failure(binding_ref, &e),
                }
            }
        }

        if !failures.is_clean() {
            failures.into_result(format!("organization {}", org_name))?;
        }
        info!(
            written = report.written.len(),
            unchanged = report.unchanged,
            removed = report.removed.len(),
            "propagation pass complete"
        );
        Ok(report)
    }

    /// Remove everything propagated for an organization
    ///
    /// Deletes the derived Roles and RoleBindings in its cluster namespaces
    /// and its bindings in the platform namespace. The shared platform Role is
    /// kept for the remaining organizations.
    #[instrument(skip(self, store, org), fields(organization = %org.name_any()))]
    pub async fn cleanup_organization<S: ObjectStore>(
        &self,
        store: &S,
        org: &Organization,
    ) -> CleanupReport {
        let org_name = org.name_any();
        let mut report = CleanupReport::default();

        let mut handled = BTreeSet::new();
        match store
            .list::<Namespace>(None, &cluster_namespace_selector(&org_name))
            .await
        {
            Ok(namespaces) => {
                for ns in namespaces {
                    let name = ns.name_any();
                    report.merge(self.cleanup_namespace(store, org, &name).await);
                    handled.insert(name);
                }
            }
            Err(e) => report.record_failure(format!("namespaces of {}", org_name), &e),
        }
        // namespaces relabeled away from the organization still hold its objects
        match self.remove_stale(store, org, &handled).await {
            Ok(stale) => report.merge(stale),
            Err(e) => report.record_failure(format!("objects propagated for {}", org_name), &e),
        }

        let uid = org.uid().unwrap_or_default();
        for rule in PROPAGATION_RULES
            .iter()
            .filter(|r| r.target == RuleTarget::PlatformNamespace)
        {
            let name = rule.binding_name(&org_name);
            let result = delete_owned::<_, RoleBinding>(
                store,
                Some(&self.platform_namespace),
                &name,
                &uid,
            )
            .await;
            report.record(object_ref(Some(&self.platform_namespace), &name), result);
        }

        if !report.is_clean() {
            warn!(failures = report.failures.len(), "organization cleanup incomplete");
        }
        report
    }

    /// Remove the objects propagated for an organization into one cluster namespace
    pub async fn cleanup_namespace<S: ObjectStore>(
        &self,
        store: &S,
        org: &Organization,
        namespace: &str,
    ) -> CleanupReport {
        let uid = org.uid().unwrap_or_default();
        let mut report = CleanupReport::default();
        for rule in PROPAGATION_RULES
            .iter()
            .filter(|r| r.target == RuleTarget::ClusterNamespaces)
        {
            let binding = rule.binding_name(&org.name_any());
            let result = delete_owned::<_, RoleBinding>(store, Some(namespace), &binding, &uid).await;
            report.record(object_ref(Some(namespace), &binding), result);

            let result =
                delete_owned::<_, Role>(store, Some(namespace), rule.derived_role, &uid).await;
            report.record(object_ref(Some(namespace), rule.derived_role), result);
        }
        report
    }
}

impl SubjectPropagator {
    /// Delete the organization's derived objects outside `keep` and the
    /// platform namespace
    ///
    /// Catches cluster namespaces that stopped belonging to the organization.
    /// Only objects the organization still controls are deleted.
    async fn remove_stale<S: ObjectStore>(
        &self,
        store: &S,
        org: &Organization,
        keep: &BTreeSet<String>,
    ) -> Result<CleanupReport> {
        let selector = LabelSelector::label_eq(PROPAGATED_FOR_LABEL, org.name_any());
        let uid = org.uid().unwrap_or_default();
        let mut report = CleanupReport::default();
        self.remove_stale_kind::<S, RoleBinding>(store, &selector, &uid, keep, &mut report)
            .await?;
        self.remove_stale_kind::<S, Role>(store, &selector, &uid, keep, &mut report)
            .await?;
        Ok(report)
    }

    async fn remove_stale_kind<S: ObjectStore, K: StoreObject>(
        &self,
        store: &S,
        selector: &LabelSelector,
        owner_uid: &str,
        keep: &BTreeSet<String>,
        report: &mut CleanupReport,
    ) -> Result<()> {
        let objects: Vec<K> = match store.list(None, selector).await {
            Ok(objects) => objects,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                report.record_failure(format!("{} propagated objects", K::KIND), &e);
                return Ok(());
            }
        };
        for obj in objects {
            let Some(ns) = obj.meta().namespace.clone() else {
                continue;
            };
            if ns == self.platform_namespace || keep.contains(&ns) {
                continue;
            }
            let name = obj.name_any();
            debug!(kind = %K::KIND, namespace = %ns, name = %name, "namespace left the organization");
            match delete_owned::<_, K>(store, Some(&ns), &name, owner_uid).await {
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                result => report.record(object_ref(Some(&ns), &name), result),
            }
        }
        Ok(())
    }
}

fn tally(report: &mut PropagationReport, target: String, outcome: Outcome) {
    match outcome {
        Outcome::Unchanged => report.unchanged += 1,
        Outcome::Created | Outcome::Updated | Outcome::Recreated => report.written.push(target),
    }
}

fn derived_metadata(name: &str, namespace: &str, organization: &str, note: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (PROPAGATED_FOR_LABEL.to_string(), organization.to_string()),
        ])),
        annotations: Some(BTreeMap::from([(NOTES_ANNOTATION.to_string(), note)])),
        ..Default::default()
    }
}

fn derived_role(rule: &PropagationRule, namespace: &str, organization: &str) -> Role {
    let mut metadata = derived_metadata(
        rule.derived_role,
        namespace,
        organization,
        format!("Grants access propagated from ClusterRole {}", rule.source_role),
    );
    if rule.target == RuleTarget::PlatformNamespace {
        // shared between organizations
        if let Some(labels) = metadata.labels.as_mut() {
            labels.remove(PROPAGATED_FOR_LABEL);
        }
        metadata.annotations = Some(BTreeMap::from([(
            NOTES_ANNOTATION.to_string(),
            "Grants read access to the shared catalogs".to_string(),
        )]));
    }
    Role {
        metadata,
        rules: Some((rule.rules)()),
    }
}

fn derived_binding(
    rule: &PropagationRule,
    namespace: &str,
    organization: &str,
    subjects: Vec<Subject>,
) -> RoleBinding {
    RoleBinding {
        metadata: derived_metadata(
            &rule.binding_name(organization),
            namespace,
            organization,
            format!(
                "Propagated from ClusterRole {} bindings of organization {}",
                rule.source_role, organization
            ),
        ),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: rule.derived_role.to_string(),
        },
        subjects: Some(subjects),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgrbac_common::fixtures::*;
    use orgrbac_common::store::{InjectedError, MemoryStore, StoreOp};
    use orgrbac_common::{ObjectKind, ORGANIZATION_LABEL};

    use crate::reconcile::controller_of;

    fn propagator() -> SubjectPropagator {
        SubjectPropagator::new(
            ProtectedNamespaces::new(["giantswarm", "kube-system"], "giantswarm"),
            "default",
            3,
        )
    }

    fn binding(store: &MemoryStore, ns: &str, name: &str) -> Option<RoleBinding> {
        store.peek(Some(ns), name)
    }

    #[test]
    fn union_defaults_service_accounts_and_dedups_users_by_name() {
        let bindings = vec![
            cluster_role_binding("org-acme", "a", "read-all", vec![
                group("readers"),
                service_account("ci", None),
            ]),
            cluster_role_binding("org-acme", "b", "read-all", vec![
                group("readers"),
                {
                    let mut u = user("jane");
                    u.namespace = Some("ignored".to_string());
                    u
                },
                user("jane"),
                service_account("ci", Some("org-acme")),
                service_account("ci", Some("other")),
            ]),
            cluster_role_binding("org-acme", "c", "cluster-admin", vec![user("root")]),
        ];

        let union = union_subjects(&bindings, "read-all", "org-acme");
        let keys: Vec<_> = union
            .iter()
            .map(|s| (s.kind.as_str(), s.name.as_str(), s.namespace.as_deref()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("Group", "readers", None),
                ("ServiceAccount", "ci", Some("org-acme")),
                ("ServiceAccount", "ci", Some("other")),
                ("User", "jane", Some("ignored")),
            ]
        );
    }

    #[test]
    fn platform_binding_names_are_unique_per_organization() {
        let platform: Vec<_> = PROPAGATION_RULES
            .iter()
            .filter(|r| r.target == RuleTarget::PlatformNamespace)
            .map(|r| r.binding_name("acme"))
            .collect();
        assert_eq!(
            platform,
            vec![
                "acme-read-all-read-shared-catalogs",
                "acme-cluster-admin-read-shared-catalogs"
            ]
        );
        assert_eq!(PROPAGATION_RULES[0].binding_name("acme"), "read-in-cluster-ns");
    }

    #[tokio::test]
    async fn source_bindings_propagate_to_cluster_and_platform_namespaces() {
        let store = MemoryStore::new();
        let org = seed_org(&store, "acme", &[], &["c1", "c2"]);
        store.insert(&cluster_role_binding("org-acme", "readers", "read-all", vec![group("readers")]));
        store.insert(&cluster_role_binding("org-acme", "admins", "cluster-admin", vec![user("root")]));

        let report = propagator().propagate(&store, &org).await.unwrap();
        assert!(!report.written.is_empty());

        for ns in ["c1", "c2"] {
            let read = binding(&store, ns, "read-in-cluster-ns").unwrap();
            assert_eq!(read.role_ref.kind, "Role");
            assert_eq!(read.subjects.unwrap(), vec![group("readers")]);
            let write = binding(&store, ns, "write-in-cluster-ns").unwrap();
            assert_eq!(write.subjects.unwrap(), vec![user("root")]);

            let role: Role = store.peek(Some(ns), "write-in-cluster-ns").unwrap();
            assert_eq!(role.rules.unwrap()[0].verbs, vec!["*"]);
        }

        let shared = binding(&store, "default", "acme-read-all-read-shared-catalogs").unwrap();
        assert_eq!(shared.role_ref.name, "read-shared-catalogs");
        let role: Role = store.peek(Some("default"), "read-shared-catalogs").unwrap();
        assert!(role.metadata.owner_references.is_none());
    }

    #[tokio::test]
    async fn second_pass_writes_nothing() {
        let store = MemoryStore::new();
        let org = seed_org(&store, "acme", &[], &["c1"]);
        store.insert(&cluster_role_binding("org-acme", "readers", "read-all", vec![group("readers")]));

        propagator().propagate(&store, &org).await.unwrap();
        store.reset_writes();
        let report = propagator().propagate(&store, &org).await.unwrap();
        assert!(report.written.is_empty());
        assert_eq!(store.total_writes(), 0);
    }

    #[tokio::test]
    async fn emptied_union_removes_derived_binding() {
        let store = MemoryStore::new();
        let org = seed_org(&store, "acme", &[], &["c1"]);
        store.insert(&cluster_role_binding("org-acme", "readers", "read-all", vec![group("readers")]));
        propagator().propagate(&store, &org).await.unwrap();
        assert!(binding(&store, "c1", "read-in-cluster-ns").is_some());

        store
            .delete::<RoleBinding>(Some("org-acme"), "readers")
            .await
            .unwrap();
        let report = propagator().propagate(&store, &org).await.unwrap();
        assert!(binding(&store, "c1", "read-in-cluster-ns").is_none());
        assert!(report.removed.contains(&"c1/read-in-cluster-ns".to_string()));
    }

    #[tokio::test]
    async fn protected_platform_namespace_keeps_only_service_accounts() {
        let store = MemoryStore::new();
        let org = seed_org(&store, "acme", &[], &[]);
        store.insert(&namespace("default", &[(orgrbac_common::PROTECTED_NAMESPACE_LABEL, "true")]));
        store.insert(&cluster_role_binding("org-acme", "readers", "read-all", vec![
            group("readers"),
            service_account("automation", Some("giantswarm")),
        ]));

        propagator().propagate(&store, &org).await.unwrap();
        let shared = binding(&store, "default", "acme-read-all-read-shared-catalogs").unwrap();
        assert_eq!(
            shared.subjects.unwrap(),
            vec![service_account("automation", Some("giantswarm"))]
        );
    }

    #[tokio::test]
    async fn failing_target_is_reported_without_stopping_others() {
        let store = MemoryStore::new();
        let org = seed_org(&store, "acme", &[], &["c1", "c2"]);
        store.insert(&cluster_role_binding("org-acme", "readers", "read-all", vec![group("readers")]));
        store.fail_always(ObjectKind::Role, StoreOp::Create, Some("c1"), InjectedError::Unavailable);

        let err = propagator().propagate(&store, &org).await.unwrap_err();
        match err {
            Error::Partial { failed, .. } => {
                assert!(failed.iter().all(|t| t.starts_with("c1/")), "{:?}", failed);
                assert!(!failed.is_empty());
            }
            other => panic!("Expected Partial, got {:?}", other),
        }
        assert!(binding(&store, "c2", "read-in-cluster-ns").is_some());
    }

    #[tokio::test]
    async fn organization_cleanup_keeps_shared_role() {
        let store = MemoryStore::new();
        let org = seed_org(&store, "acme", &[], &["c1"]);
        store.insert(&cluster_role_binding("org-acme", "readers", "read-all", vec![group("readers")]));
        store.insert(&cluster_role_binding("org-acme", "admins", "cluster-admin", vec![user("root")]));
        propagator().propagate(&store, &org).await.unwrap();

        let report = propagator().cleanup_organization(&store, &org).await;
        assert!(report.is_clean());
        assert!(binding(&store, "c1", "read-in-cluster-ns").is_none());
        assert!(store.peek::<Role>(Some("c1"), "write-in-cluster-ns").is_none());
        assert!(binding(&store, "default", "acme-read-all-read-shared-catalogs").is_none());
        assert!(store.peek::<Role>(Some("default"), "read-shared-catalogs").is_some());
        assert!(report.removed.contains(&"default/acme-cluster-admin-read-shared-catalogs".to_string()));
    }

    #[tokio::test]
    async fn cleanup_accumulates_failures() {
        let store = MemoryStore::new();
        let org = seed_org(&store, "acme", &[], &["c1", "c2"]);
        store.insert(&cluster_role_binding("org-acme", "readers", "read-all", vec![group("readers")]));
        propagator().propagate(&store, &org).await.unwrap();

        store.fail_always(ObjectKind::RoleBinding, StoreOp::Delete, Some("c1"), InjectedError::Unavailable);
        let report = propagator().cleanup_organization(&store, &org).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].target, "c1/read-in-cluster-ns");
        assert!(binding(&store, "c2", "read-in-cluster-ns").is_none());
    }

    #[tokio::test]
    async fn relabeled_cluster_namespace_moves_to_new_organization() {
        let store = MemoryStore::new();
        let acme = seed_org(&store, "acme", &[], &["c1"]);
        let globex = seed_org(&store, "globex", &[], &[]);
        store.insert(&cluster_role_binding("org-acme", "admins", "cluster-admin", vec![user("acme-admin")]));
        store.insert(&cluster_role_binding("org-globex", "admins", "cluster-admin", vec![user("globex-admin")]));
        propagator().propagate(&store, &acme).await.unwrap();
        assert!(binding(&store, "c1", "write-in-cluster-ns").is_some());

        store
            .merge_patch::<Namespace>(
                None,
                "c1",
                &serde_json::json!({"metadata": {"labels": {ORGANIZATION_LABEL: "globex"}}}),
            )
            .await
            .unwrap();

        let report = propagator().propagate(&store, &acme).await.unwrap();
        assert!(report.removed.contains(&"c1/write-in-cluster-ns".to_string()));
        assert!(binding(&store, "c1", "write-in-cluster-ns").is_none());
        assert!(store.peek::<Role>(Some("c1"), "write-in-cluster-ns").is_none());

        propagator().propagate(&store, &globex).await.unwrap();
        let write = binding(&store, "c1", "write-in-cluster-ns").unwrap();
        assert_eq!(write.subjects.clone().unwrap(), vec![user("globex-admin")]);
        assert_eq!(
            controller_of(&write).map(|r| r.name.as_str()),
            Some("globex")
        );
    }

    #[tokio::test]
    async fn organization_cleanup_reaches_relabeled_namespaces() {
        let store = MemoryStore::new();
        let acme = seed_org(&store, "acme", &[], &["c1"]);
        store.insert(&cluster_role_binding("org-acme", "admins", "cluster-admin", vec![user("acme-admin")]));
        propagator().propagate(&store, &acme).await.unwrap();
        store
            .merge_patch::<Namespace>(
                None,
                "c1",
                &serde_json::json!({"metadata": {"labels": {ORGANIZATION_LABEL: "globex"}}}),
            )
            .await
            .unwrap();

        let report = propagator().cleanup_organization(&store, &acme).await;
        assert!(report.is_clean());
        assert!(binding(&store, "c1", "write-in-cluster-ns").is_none());
        assert!(store.peek::<Role>(Some("c1"), "write-in-cluster-ns").is_none());
    }

    #[tokio::test]
    async fn terminating_cluster_namespace_is_cleaned() {
        let store = MemoryStore::new();
        let org = seed_org(&store, "acme", &[], &["c1"]);
        store.insert(&cluster_role_binding("org-acme", "readers", "read-all", vec![group("readers")]));
        propagator().propagate(&store, &org).await.unwrap();

        store.touch::<Namespace>(None, "c1", |v| {
            v["status"] = serde_json::json!({"phase": "Terminating"});
        });
        let report = propagator().propagate(&store, &org).await.unwrap();
        assert!(report.removed.contains(&"c1/read-in-cluster-ns".to_string()));
        assert!(store.peek::<Role>(Some("c1"), "read-in-cluster-ns").is_none());
    }
}
