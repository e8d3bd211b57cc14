//! Object builders for tests of crates built on orgrbac-common

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{
    BindingTemplate, LabelSelector, Organization, OrganizationSpec, OrganizationStatus,
    RoleBindingTemplate, RoleBindingTemplateSpec, RoleRefKind, SubjectKind, TemplateMetadata,
    TemplateRoleRef, TemplateScope, TemplateSubject,
};
use crate::store::MemoryStore;
use crate::{CLUSTER_LABEL, ORGANIZATION_LABEL, RBAC_API_GROUP};

fn label_map(labels: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// Namespace with labels
pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: label_map(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Cluster namespace belonging to an organization
pub fn cluster_namespace(name: &str, organization: &str) -> Namespace {
    namespace(name, &[(ORGANIZATION_LABEL, organization), (CLUSTER_LABEL, name)])
}

/// Organization with labels and an optional owned namespace
pub fn organization(name: &str, labels: &[(&str, &str)], owned: Option<&str>) -> Organization {
    let mut org = Organization::new(name, OrganizationSpec::default());
    org.metadata.labels = label_map(labels);
    org.status = Some(OrganizationStatus {
        namespace: owned.map(str::to_string),
    });
    org
}

/// Seed an organization owning `org-<name>` plus its cluster namespaces
pub fn seed_org(
    store: &MemoryStore,
    name: &str,
    labels: &[(&str, &str)],
    clusters: &[&str],
) -> Organization {
    let org_ns = format!("org-{}", name);
    store.insert(&namespace(&org_ns, &[(ORGANIZATION_LABEL, name)]));
    for cluster in clusters {
        store.insert(&cluster_namespace(cluster, name));
    }
    store.insert(&organization(name, labels, Some(&org_ns)))
}

/// User subject
pub fn user(name: &str) -> Subject {
    Subject {
        kind: "User".to_string(),
        name: name.to_string(),
        namespace: None,
        api_group: Some(RBAC_API_GROUP.to_string()),
    }
}

/// Group subject
pub fn group(name: &str) -> Subject {
    Subject {
        kind: "Group".to_string(),
        name: name.to_string(),
        namespace: None,
        api_group: Some(RBAC_API_GROUP.to_string()),
    }
}

/// ServiceAccount subject
pub fn service_account(name: &str, namespace: Option<&str>) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: namespace.map(str::to_string),
        api_group: None,
    }
}

/// RoleBinding to a ClusterRole
pub fn cluster_role_binding(
    namespace: &str,
    name: &str,
    cluster_role: &str,
    subjects: Vec<Subject>,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(subjects),
    }
}

/// Template subject
pub fn template_subject(kind: SubjectKind, name: &str, namespace: Option<&str>) -> TemplateSubject {
    TemplateSubject {
        kind,
        name: name.to_string(),
        namespace: namespace.map(str::to_string),
        api_group: None,
    }
}

/// RoleBindingTemplate granting a ClusterRole to subjects in selected organizations
pub fn template(
    name: &str,
    cluster_role: &str,
    subjects: Vec<TemplateSubject>,
    selector: LabelSelector,
) -> RoleBindingTemplate {
    RoleBindingTemplate::new(
        name,
        RoleBindingTemplateSpec {
            template: BindingTemplate {
                metadata: TemplateMetadata::default(),
                subjects,
                role_ref: TemplateRoleRef {
                    kind: RoleRefKind::ClusterRole,
                    name: cluster_role.to_string(),
                    api_group: String::new(),
                },
            },
            scope: TemplateScope {
                organization_selector: selector,
            },
        },
    )
}
