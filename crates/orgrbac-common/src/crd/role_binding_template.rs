//! RoleBindingTemplate Custom Resource Definition
//!
//! A RoleBindingTemplate describes a RoleBinding that should exist in every
//! namespace belonging to the organizations matched by its scope: each
//! selected organization's own namespace plus all of its cluster namespaces.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: auth.giantswarm.io/v1alpha1
//! kind: RoleBindingTemplate
//! metadata:
//!   name: flux-reconciler
//! spec:
//!   template:
//!     metadata:
//!       name: flux-reconciler
//!     subjects:
//!       - kind: ServiceAccount
//!         name: automation
//!     roleRef:
//!       kind: ClusterRole
//!       name: cluster-admin
//!   scope:
//!     organizationSelector:
//!       matchLabels:
//!         giantswarm.io/customer-tier: gold
//! ```

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{RoleRef, Subject};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::selector::LabelSelector;
use super::types::Condition;
use crate::RBAC_API_GROUP;

/// Kind of an RBAC subject
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubjectKind {
    /// A user identity
    User,
    /// A group of users
    Group,
    /// A namespaced service account
    ServiceAccount,
}

impl SubjectKind {
    /// Kubernetes string form of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Group => "Group",
            Self::ServiceAccount => "ServiceAccount",
        }
    }
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject granted the referenced role
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSubject {
    /// Kind of subject
    pub kind: SubjectKind,

    /// Name of the user, group or service account
    pub name: String,

    /// Namespace of a service account
    ///
    /// Unset means the namespace receiving the derived binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// API group of the subject (defaults to the RBAC group for users and groups)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
}

impl TemplateSubject {
    /// Convert to an RBAC subject as written into a binding in `target_namespace`
    pub fn to_subject(&self, target_namespace: &str) -> Subject {
        match self.kind {
            SubjectKind::ServiceAccount => Subject {
                kind: self.kind.as_str().to_string(),
                name: self.name.clone(),
                namespace: Some(
                    self.namespace
                        .clone()
                        .filter(|ns| !ns.is_empty())
                        .unwrap_or_else(|| target_namespace.to_string()),
                ),
                api_group: self.api_group.clone().filter(|g| !g.is_empty()),
            },
            SubjectKind::User | SubjectKind::Group => Subject {
                kind: self.kind.as_str().to_string(),
                name: self.name.clone(),
                namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
                api_group: Some(
                    self.api_group
                        .clone()
                        .filter(|g| !g.is_empty())
                        .unwrap_or_else(|| RBAC_API_GROUP.to_string()),
                ),
            },
        }
    }
}

/// Kind of role a binding refers to
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RoleRefKind {
    /// A namespaced Role (must exist in every target namespace)
    Role,
    /// A cluster-wide ClusterRole
    ClusterRole,
}

impl RoleRefKind {
    /// Kubernetes string form of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Role => "Role",
            Self::ClusterRole => "ClusterRole",
        }
    }
}

/// Role referenced by the derived bindings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRoleRef {
    /// Kind of the referenced role
    pub kind: RoleRefKind,

    /// Name of the referenced role
    pub name: String,

    /// API group of the referenced role; empty means `rbac.authorization.k8s.io`
    #[serde(default)]
    pub api_group: String,
}

impl TemplateRoleRef {
    /// Convert to an RBAC role reference with the API group defaulted
    pub fn to_role_ref(&self) -> RoleRef {
        RoleRef {
            api_group: if self.api_group.is_empty() {
                RBAC_API_GROUP.to_string()
            } else {
                self.api_group.clone()
            },
            kind: self.kind.as_str().to_string(),
            name: self.name.clone(),
        }
    }
}

/// Metadata copied onto every derived binding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Name of the derived bindings (defaults to the template name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Labels added to the derived bindings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations added to the derived bindings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// The desired binding
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingTemplate {
    /// Metadata of the derived bindings
    #[serde(default)]
    pub metadata: TemplateMetadata,

    /// Subjects granted the role
    #[serde(default)]
    pub subjects: Vec<TemplateSubject>,

    /// Role the subjects are granted
    pub role_ref: TemplateRoleRef,
}

/// Where the template is materialized
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateScope {
    /// Selector over Organizations; every selected organization's namespace
    /// and cluster namespaces receive a derived binding
    #[serde(default)]
    pub organization_selector: LabelSelector,
}

/// Phase of a RoleBindingTemplate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TemplatePhase {
    /// A new generation is being materialized
    #[default]
    Progressing,
    /// Every namespace in scope holds its derived binding
    Succeeded,
    /// At least one namespace could not be reconciled
    Failed,
}

impl std::fmt::Display for TemplatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Progressing => write!(f, "Progressing"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A namespace whose derived binding could not be reconciled
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct FailedNamespace {
    /// Namespace name
    pub namespace: String,
    /// Why reconciliation failed
    pub reason: String,
}

/// Status of a RoleBindingTemplate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleBindingTemplateStatus {
    /// Current phase
    #[serde(default)]
    pub phase: TemplatePhase,

    /// Namespaces currently holding a derived binding (sorted)
    #[serde(default)]
    pub provisioned_namespaces: Vec<String>,

    /// Namespaces that failed in the last pass
    #[serde(default)]
    pub failed_namespaces: Vec<FailedNamespace>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation observed by the last completed pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a RoleBindingTemplate
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "auth.giantswarm.io",
    version = "v1alpha1",
    kind = "RoleBindingTemplate",
    plural = "rolebindingtemplates",
    shortname = "rbt",
    status = "RoleBindingTemplateStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RoleBindingTemplateSpec {
    /// The binding to materialize
    pub template: BindingTemplate,

    /// Organizations whose namespaces receive the binding
    #[serde(default)]
    pub scope: TemplateScope,
}

impl RoleBindingTemplateSpec {
    /// Validate the spec before anything is written
    pub fn validate(&self, template_name: &str) -> crate::Result<()> {
        if let Some(name) = &self.template.metadata.name {
            super::validate_object_name(name).map_err(|msg| {
                crate::Error::validation_for_field(template_name, "spec.template.metadata.name", msg)
            })?;
        }

        let role_ref = &self.template.role_ref;
        if role_ref.name.is_empty() {
            return Err(crate::Error::validation_for_field(
                template_name,
                "spec.template.roleRef.name",
                "role name cannot be empty",
            ));
        }
        if !role_ref.api_group.is_empty() && role_ref.api_group != RBAC_API_GROUP {
            return Err(crate::Error::validation_for_field(
                template_name,
                "spec.template.roleRef.apiGroup",
                format!("unsupported API group {:?}", role_ref.api_group),
            ));
        }

        for (i, subject) in self.template.subjects.iter().enumerate() {
            if subject.name.is_empty() {
                return Err(crate::Error::validation_for_field(
                    template_name,
                    format!("spec.template.subjects[{}].name", i),
                    "subject name cannot be empty",
                ));
            }
        }

        self.scope
            .organization_selector
            .validate(template_name, "spec.scope.organizationSelector")
    }
}

impl RoleBindingTemplate {
    /// Name of the derived bindings (template metadata name or the template's own name)
    pub fn binding_name(&self) -> String {
        self.spec
            .template
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.metadata.name.clone().unwrap_or_default())
    }
}
