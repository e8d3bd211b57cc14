//! Protected-namespace subject filter
//!
//! Tenant-origin subjects must never gain access to platform namespaces. In a
//! protected namespace only service accounts of the automation namespace or of
//! the namespace itself survive.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::rbac::v1::Subject;
use orgrbac_common::{OperatorConfig, PROTECTED_NAMESPACE_LABEL};

/// The set of protected namespaces plus the automation namespace
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedNamespaces {
    names: BTreeSet<String>,
    automation_namespace: String,
}

impl ProtectedNamespaces {
    /// Create a filter protecting `names`
    pub fn new<I, N>(names: I, automation_namespace: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            automation_namespace: automation_namespace.into(),
        }
    }

    /// Build the filter from operator configuration
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self::new(
            config.protected_namespaces.iter().cloned(),
            config.automation_namespace.clone(),
        )
    }

    /// Whether a namespace is protected by name or by label
    pub fn is_protected(&self, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
        self.names.contains(namespace)
            || labels
                .get(PROTECTED_NAMESPACE_LABEL)
                .is_some_and(|v| v == "true")
    }

    /// Subjects allowed into a binding in `namespace`
    pub fn filter(
        &self,
        subjects: &[Subject],
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Vec<Subject> {
        if !self.is_protected(namespace, labels) {
            return subjects.to_vec();
        }
        subjects
            .iter()
            .filter(|s| {
                s.kind == "ServiceAccount"
                    && s.namespace.as_deref().is_none_or(|ns| {
                        ns.is_empty() || ns == namespace || ns == self.automation_namespace
                    })
            })
            .cloned()
            .collect()
    }
}
