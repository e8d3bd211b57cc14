//! Custom Resource Definitions for orgrbac
//!
//! Organization is consumed read-only; RoleBindingTemplate is owned by the
//! template controller and installed with `orgrbac --crd`.

mod organization;
mod role_binding_template;
mod selector;
mod types;

pub use organization::{Organization, OrganizationSpec, OrganizationStatus};
pub use role_binding_template::{
    BindingTemplate, FailedNamespace, RoleBindingTemplate, RoleBindingTemplateSpec,
    RoleBindingTemplateStatus, RoleRefKind, SubjectKind, TemplateMetadata, TemplatePhase,
    TemplateRoleRef, TemplateScope, TemplateSubject,
};
pub use selector::{LabelSelector, LabelSelectorOperator, LabelSelectorRequirement};
pub use types::{Condition, ConditionStatus, CONDITION_READY};

/// Maximum length of an object name (DNS subdomain)
const MAX_OBJECT_NAME_LEN: usize = 253;

/// Validate an object name as a DNS subdomain.
///
/// Rules:
/// - Must not be empty or longer than 253 characters
/// - May contain lowercase letters, digits, '-' and '.'
/// - Must start and end with a lowercase letter or digit
pub(crate) fn validate_object_name(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if s.len() > MAX_OBJECT_NAME_LEN {
        return Err(format!(
            "name must be at most {} characters: {}",
            MAX_OBJECT_NAME_LEN, s
        ));
    }

    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    if !s.chars().all(|c| alnum(c) || c == '-' || c == '.') {
        return Err(format!(
            "name must be lowercase alphanumeric with '-' or '.': {}",
            s
        ));
    }
    if !s.starts_with(alnum) || !s.ends_with(alnum) {
        return Err(format!(
            "name must start and end with an alphanumeric character: {}",
            s
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_follow_dns_subdomain_rules() {
        assert!(validate_object_name("flux-reconciler").is_ok());
        assert!(validate_object_name("read.all").is_ok());
        assert!(validate_object_name("0admins").is_ok());

        assert!(validate_object_name("").is_err());
        assert!(validate_object_name("Admins").is_err());
        assert!(validate_object_name("admins-").is_err());
        assert!(validate_object_name("-admins").is_err());
        assert!(validate_object_name("under_score").is_err());
        assert!(validate_object_name(&"a".repeat(254)).is_err());
    }
}
