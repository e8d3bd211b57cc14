//! Operator configuration
//!
//! Configuration is read through the [`ConfigSource`] trait so tests can
//! supply values without touching process environment.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::{Error, Result};

/// Namespace holding the platform's automation service accounts
pub const DEFAULT_AUTOMATION_NAMESPACE: &str = "giantswarm";

/// Shared namespace receiving platform-namespace propagation
pub const DEFAULT_PLATFORM_NAMESPACE: &str = "default";

/// Namespaces protected by default
pub const DEFAULT_PROTECTED_NAMESPACES: &[&str] = &["giantswarm", "org-giantswarm", "kube-system"];

/// Default interval between periodic resyncs
pub const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Default delay before retrying a failed pass
pub const DEFAULT_ERROR_REQUEUE_SECONDS: u64 = 15;

/// Default number of conflict retries in the reconciliation primitive
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

/// Trait for reading configuration values
///
/// This abstracts reading from environment variables, enabling
/// proper unit testing without manipulating global state.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigSource: Send + Sync {
    /// Raw value of a configuration key, `None` when unset
    fn var(&self, key: &str) -> Option<String>;
}

/// Default implementation that reads from environment variables
#[derive(Clone, Default)]
pub struct OsEnvConfig;

impl ConfigSource for OsEnvConfig {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Runtime configuration of the operator
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Namespace whose service accounts survive protected-namespace filtering
    pub automation_namespace: String,
    /// Namespace receiving the shared catalog Role and per-organization bindings
    pub platform_namespace: String,
    /// Namespaces protected by name
    pub protected_namespaces: BTreeSet<String>,
    /// Interval between periodic resyncs of converged objects
    pub requeue_interval: Duration,
    /// Delay before retrying a pass that failed with a retryable error
    pub error_requeue: Duration,
    /// Conflict retries in the reconciliation primitive
    pub max_conflict_retries: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            automation_namespace: DEFAULT_AUTOMATION_NAMESPACE.to_string(),
            platform_namespace: DEFAULT_PLATFORM_NAMESPACE.to_string(),
            protected_namespaces: DEFAULT_PROTECTED_NAMESPACES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            requeue_interval: Duration::from_secs(DEFAULT_REQUEUE_SECONDS),
            error_requeue: Duration::from_secs(DEFAULT_ERROR_REQUEUE_SECONDS),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

impl OperatorConfig {
    /// Read configuration, falling back to defaults for unset keys
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let defaults = Self::default();

        let automation_namespace = namespace_var(source, "ORGRBAC_AUTOMATION_NAMESPACE")?
            .unwrap_or(defaults.automation_namespace);
        let platform_namespace = namespace_var(source, "ORGRBAC_PLATFORM_NAMESPACE")?
            .unwrap_or(defaults.platform_namespace);

        let protected_namespaces = match source.var("ORGRBAC_PROTECTED_NAMESPACES") {
            Some(raw) => {
                let names: BTreeSet<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if let Some(bad) = names
                    .iter()
                    .find(|n| crate::crd::validate_object_name(n).is_err())
                {
                    return Err(Error::validation_for_field(
                        "config",
                        "ORGRBAC_PROTECTED_NAMESPACES",
                        format!("invalid namespace name {:?}", bad),
                    ));
                }
                names
            }
            None => defaults.protected_namespaces,
        };

        let requeue_interval = seconds_var(source, "ORGRBAC_REQUEUE_SECONDS")?
            .unwrap_or(defaults.requeue_interval);
        let error_requeue = seconds_var(source, "ORGRBAC_ERROR_REQUEUE_SECONDS")?
            .unwrap_or(defaults.error_requeue);

        let max_conflict_retries = match source.var("ORGRBAC_MAX_CONFLICT_RETRIES") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|e| {
                Error::validation_for_field(
                    "config",
                    "ORGRBAC_MAX_CONFLICT_RETRIES",
                    format!("invalid number {:?}: {}", raw, e),
                )
            })?,
            None => defaults.max_conflict_retries,
        };

        Ok(Self {
            automation_namespace,
            platform_namespace,
            protected_namespaces,
            requeue_interval,
            error_requeue,
            max_conflict_retries,
        })
    }

    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_source(&OsEnvConfig)
    }
}

fn namespace_var(source: &dyn ConfigSource, key: &str) -> Result<Option<String>> {
    let Some(raw) = source.var(key) else {
        return Ok(None);
    };
    let value = raw.trim().to_string();
    crate::crd::validate_object_name(&value)
        .map_err(|msg| Error::validation_for_field("config", key, msg))?;
    Ok(Some(value))
}

fn seconds_var(source: &dyn ConfigSource, key: &str) -> Result<Option<Duration>> {
    let Some(raw) = source.var(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(Error::validation_for_field(
            "config",
            key,
            "interval must be at least one second",
        )),
        Ok(secs) => Ok(Some(Duration::from_secs(secs))),
        Err(e) => Err(Error::validation_for_field(
            "config",
            key,
            format!("invalid number {:?}: {}", raw, e),
        )),
    }
}
