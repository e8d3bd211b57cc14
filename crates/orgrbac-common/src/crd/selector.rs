//! Label selectors
//!
//! A `LabelSelector` is used in two ways: as the `organizationSelector` of a
//! RoleBindingTemplate scope (user-authored, validated before use), and as the
//! query type of [`ObjectStore::list`](crate::store::ObjectStore::list). It
//! renders to the Kubernetes label-selector query syntax for server-side
//! filtering and can also be evaluated locally against a label map.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Maximum length of a label name or value
const MAX_LABEL_NAME_LEN: usize = 63;
/// Maximum length of a label key prefix (DNS subdomain)
const MAX_LABEL_PREFIX_LEN: usize = 253;

/// Operator for label selector requirements
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    /// Label value must be in the specified set
    In,
    /// Label value must not be in the specified set
    NotIn,
    /// Label must exist (value ignored)
    Exists,
    /// Label must not exist (value ignored)
    DoesNotExist,
}

impl LabelSelectorOperator {
    /// Check if a label value matches this requirement
    ///
    /// - `label_value`: The actual label value (None if label doesn't exist)
    /// - `values`: The values specified in the requirement
    pub fn matches(&self, label_value: Option<&str>, values: &[String]) -> bool {
        match self {
            Self::In => label_value.is_some_and(|v| values.iter().any(|req| req == v)),
            Self::NotIn => {
                label_value.is_none() || !values.iter().any(|req| Some(req.as_str()) == label_value)
            }
            Self::Exists => label_value.is_some(),
            Self::DoesNotExist => label_value.is_none(),
        }
    }

    fn takes_values(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

/// A label selector requirement (mirrors Kubernetes LabelSelectorRequirement)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to
    pub key: String,

    /// Operator representing the relationship between label and values
    pub operator: LabelSelectorOperator,

    /// Array of string values
    ///
    /// - For `In` and `NotIn` operators: must be non-empty
    /// - For `Exists` and `DoesNotExist`: must be empty
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    /// Check if a label set matches this requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key).map(|s| s.as_str());
        self.operator.matches(value, &self.values)
    }

    fn to_query(&self) -> String {
        match self.operator {
            LabelSelectorOperator::In => format!("{} in ({})", self.key, self.values.join(",")),
            LabelSelectorOperator::NotIn => {
                format!("{} notin ({})", self.key, self.values.join(","))
            }
            LabelSelectorOperator::Exists => self.key.clone(),
            LabelSelectorOperator::DoesNotExist => format!("!{}", self.key),
        }
    }
}

/// Label selector over `matchLabels` and `matchExpressions`
///
/// An empty selector `{}` matches every object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Map of label key-value pairs for exact matching
    ///
    /// All labels must match for the object to be selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    /// List of label selector requirements
    ///
    /// All requirements must be satisfied for the object to be selected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Selector requiring `key=value`
    pub fn label_eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and_eq(key, value)
    }

    /// Add a `key=value` clause
    pub fn and_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Add a clause requiring `key` to be present
    pub fn and_exists(mut self, key: impl Into<String>) -> Self {
        self.match_expressions.push(LabelSelectorRequirement {
            key: key.into(),
            operator: LabelSelectorOperator::Exists,
            values: vec![],
        });
        self
    }

    /// Check if a label set matches this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        // Check matchLabels (all must match)
        if let Some(match_labels) = &self.match_labels {
            for (key, value) in match_labels {
                if labels.get(key) != Some(value) {
                    return false;
                }
            }
        }

        // Check matchExpressions (all must match)
        self.match_expressions.iter().all(|req| req.matches(labels))
    }

    /// Check if this selector is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.match_labels.as_ref().is_none_or(|m| m.is_empty())
            && self.match_expressions.is_empty()
    }

    /// Render in Kubernetes label-selector query syntax (`a=b,c in (x,y),!d`)
    pub fn to_query(&self) -> String {
        let mut clauses: Vec<String> = self
            .match_labels
            .iter()
            .flatten()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        clauses.extend(self.match_expressions.iter().map(|r| r.to_query()));
        clauses.join(",")
    }

    /// Validate the selector, reporting the offending field relative to `field_root`
    ///
    /// Rejects syntactically invalid keys and values, `In`/`NotIn` without
    /// values, and `Exists`/`DoesNotExist` with values.
    pub fn validate(&self, object: &str, field_root: &str) -> crate::Result<()> {
        for (key, value) in self.match_labels.iter().flatten() {
            let field = format!("{}.matchLabels", field_root);
            validate_label_key(key)
                .map_err(|msg| crate::Error::validation_for_field(object, &field, msg))?;
            validate_label_value(value)
                .map_err(|msg| crate::Error::validation_for_field(object, &field, msg))?;
        }

        for (i, req) in self.match_expressions.iter().enumerate() {
            let field = format!("{}.matchExpressions[{}]", field_root, i);
            validate_label_key(&req.key)
                .map_err(|msg| crate::Error::validation_for_field(object, &field, msg))?;

            if req.operator.takes_values() && req.values.is_empty() {
                return Err(crate::Error::validation_for_field(
                    object,
                    format!("{}.values", field),
                    format!("operator {:?} requires at least one value", req.operator),
                ));
            }
            if !req.operator.takes_values() && !req.values.is_empty() {
                return Err(crate::Error::validation_for_field(
                    object,
                    format!("{}.values", field),
                    format!("operator {:?} does not take values", req.operator),
                ));
            }
            for value in &req.values {
                validate_label_value(value).map_err(|msg| {
                    crate::Error::validation_for_field(object, format!("{}.values", field), msg)
                })?;
            }
        }

        Ok(())
    }
}

/// Validate a label key: optional DNS-subdomain prefix, `/`, and a name segment
fn validate_label_key(key: &str) -> Result<(), String> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > MAX_LABEL_PREFIX_LEN {
            return Err(format!("invalid label key prefix: {:?}", key));
        }
        let valid = prefix.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !part.starts_with('-')
                && !part.ends_with('-')
        });
        if !valid {
            return Err(format!("invalid label key prefix: {:?}", key));
        }
    }

    if name.is_empty() {
        return Err(format!("label key name cannot be empty: {:?}", key));
    }
    validate_label_segment(name).map_err(|e| format!("invalid label key {:?}: {}", key, e))
}

/// Validate a label value (may be empty)
fn validate_label_value(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    validate_label_segment(value).map_err(|e| format!("invalid label value {:?}: {}", value, e))
}

fn validate_label_segment(s: &str) -> Result<(), String> {
    if s.len() > MAX_LABEL_NAME_LEN {
        return Err(format!("must be at most {} characters", MAX_LABEL_NAME_LEN));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err("must consist of alphanumerics, '-', '_' or '.'".to_string());
    }
    let first = s.chars().next();
    let last = s.chars().last();
    if !first.is_some_and(|c| c.is_ascii_alphanumeric())
        || !last.is_some_and(|c| c.is_ascii_alphanumeric())
    {
        return Err("must start and end with an alphanumeric character".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(
        key: &str,
        operator: LabelSelectorOperator,
        values: &[&str],
    ) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("any", "thing")])));
        assert_eq!(selector.to_query(), "");
    }

    #[test]
    fn match_labels_require_every_pair() {
        let selector = LabelSelector::label_eq("tier", "gold").and_eq("region", "eu");
        assert!(selector.matches(&labels(&[("tier", "gold"), ("region", "eu")])));
        assert!(!selector.matches(&labels(&[("tier", "gold")])));
        assert!(!selector.matches(&labels(&[("tier", "silver"), ("region", "eu")])));
    }

    #[test]
    fn expressions_follow_kubernetes_semantics() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: vec![
                requirement("tier", LabelSelectorOperator::In, &["gold", "silver"]),
                requirement("legacy", LabelSelectorOperator::DoesNotExist, &[]),
            ],
        };
        assert!(selector.matches(&labels(&[("tier", "silver")])));
        assert!(!selector.matches(&labels(&[("tier", "bronze")])));
        assert!(!selector.matches(&labels(&[("tier", "gold"), ("legacy", "true")])));

        let not_in = requirement("env", LabelSelectorOperator::NotIn, &["prod"]);
        assert!(not_in.matches(&labels(&[])));
        assert!(not_in.matches(&labels(&[("env", "dev")])));
        assert!(!not_in.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn query_string_renders_every_operator() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("giantswarm.io/organization", "acme")])),
            match_expressions: vec![
                requirement("tier", LabelSelectorOperator::In, &["gold", "silver"]),
                requirement("env", LabelSelectorOperator::NotIn, &["prod"]),
                requirement("giantswarm.io/cluster", LabelSelectorOperator::Exists, &[]),
                requirement("legacy", LabelSelectorOperator::DoesNotExist, &[]),
            ],
        };
        assert_eq!(
            selector.to_query(),
            "giantswarm.io/organization=acme,tier in (gold,silver),env notin (prod),giantswarm.io/cluster,!legacy"
        );
    }

    #[test]
    fn builder_combines_equality_and_existence() {
        let selector = LabelSelector::label_eq("giantswarm.io/organization", "acme")
            .and_exists("giantswarm.io/cluster");
        assert_eq!(
            selector.to_query(),
            "giantswarm.io/organization=acme,giantswarm.io/cluster"
        );
        assert!(selector.matches(&labels(&[
            ("giantswarm.io/organization", "acme"),
            ("giantswarm.io/cluster", "wc1"),
        ])));
        assert!(!selector.matches(&labels(&[("giantswarm.io/organization", "acme")])));
    }

    #[test]
    fn validation_accepts_well_formed_selectors() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("giantswarm.io/organization", "acme")])),
            match_expressions: vec![requirement(
                "customer_tier",
                LabelSelectorOperator::In,
                &["gold"],
            )],
        };
        assert!(selector.validate("admins", "spec.scope").is_ok());
    }

    #[test]
    fn validation_rejects_in_without_values() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: vec![requirement("tier", LabelSelectorOperator::In, &[])],
        };
        let err = selector
            .validate("admins", "spec.scope.organizationSelector")
            .unwrap_err();
        match err {
            crate::Error::Validation { field, message, .. } => {
                assert_eq!(
                    field.as_deref(),
                    Some("spec.scope.organizationSelector.matchExpressions[0].values")
                );
                assert!(message.contains("requires at least one value"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_exists_with_values() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: vec![requirement("tier", LabelSelectorOperator::Exists, &["x"])],
        };
        assert!(selector.validate("admins", "spec").is_err());
    }

    #[test]
    fn validation_rejects_malformed_keys_and_values() {
        for key in ["", "/name", "Bad_Prefix/name", "prefix/", "-leading", "has space"] {
            let selector = LabelSelector::label_eq(key, "v");
            assert!(selector.validate("t", "spec").is_err(), "key {key:?} accepted");
        }
        let too_long = "x".repeat(64);
        for value in ["-leading", "trailing-", "with space", too_long.as_str()] {
            let selector = LabelSelector::label_eq("k", value);
            assert!(selector.validate("t", "spec").is_err(), "value {value:?} accepted");
        }
        assert!(LabelSelector::label_eq("k", "").validate("t", "spec").is_ok());
    }
}
