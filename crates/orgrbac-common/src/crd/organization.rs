//! Organization Custom Resource Definition
//!
//! Organizations are created and deleted by the platform's tenant management,
//! which also provisions the namespace each organization owns and reports it in
//! `status.namespace`. orgrbac treats them as read-only input apart from its
//! own cleanup finalizer.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for an Organization (intentionally empty)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "security.giantswarm.io",
    version = "v1alpha1",
    kind = "Organization",
    plural = "organizations",
    status = "OrganizationStatus",
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".status.namespace"}"#
)]
pub struct OrganizationSpec {}

/// Status of an Organization
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationStatus {
    /// Namespace owned by the organization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Organization {
    /// Namespace owned by this organization, if it has been provisioned
    pub fn owned_namespace(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.namespace.as_deref())
            .filter(|ns| !ns.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_namespace_requires_status() {
        let mut org = Organization::new("acme", OrganizationSpec::default());
        assert_eq!(org.owned_namespace(), None);

        org.status = Some(OrganizationStatus {
            namespace: Some(String::new()),
        });
        assert_eq!(org.owned_namespace(), None);

        org.status = Some(OrganizationStatus {
            namespace: Some("org-acme".to_string()),
        });
        assert_eq!(org.owned_namespace(), Some("org-acme"));
    }

    #[test]
    fn status_round_trips_from_api_json() {
        let org: Organization = serde_json::from_value(serde_json::json!({
            "apiVersion": "security.giantswarm.io/v1alpha1",
            "kind": "Organization",
            "metadata": { "name": "acme" },
            "spec": {},
            "status": { "namespace": "org-acme" }
        }))
        .unwrap();
        assert_eq!(org.owned_namespace(), Some("org-acme"));
    }
}
