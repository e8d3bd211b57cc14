//! Reconcilers for the two watched kinds
//!
//! Both controllers share the error policy and the finalizer handling here.

pub mod organization;
pub mod template;

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use orgrbac_common::{Error, ObjectStore, Result, StoreObject};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::Context;

/// Requeue policy after a failed pass
///
/// Retryable errors come back after `error_requeue`; everything else waits for
/// the object (or something it watches) to change.
pub fn error_policy<K, S>(obj: Arc<K>, error: &Error, ctx: Arc<Context<S>>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    if error.is_retryable() {
        warn!(
            ?error,
            kind = %K::kind(&()),
            name = %obj.name_any(),
            "reconciliation failed, requeueing"
        );
        Action::requeue(ctx.config.error_requeue)
    } else {
        error!(
            ?error,
            kind = %K::kind(&()),
            name = %obj.name_any(),
            "reconciliation failed, waiting for a change"
        );
        Action::await_change()
    }
}

/// Check if an object carries `finalizer`
pub(crate) fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

fn finalizer_patch<K: ResourceExt>(obj: &K, finalizers: Vec<String>) -> Value {
    let finalizers = if finalizers.is_empty() {
        Value::Null
    } else {
        json!(finalizers)
    };
    json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    })
}

/// Add `finalizer` unless it is already present
pub(crate) async fn add_finalizer<S, K>(store: &S, obj: &K, finalizer: &str) -> Result<()>
where
    S: ObjectStore,
    K: StoreObject,
{
    if has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    store
        .merge_patch::<K>(
            obj.namespace().as_deref(),
            &obj.name_any(),
            &finalizer_patch(obj, finalizers),
        )
        .await?;
    debug!(name = %obj.name_any(), finalizer, "added finalizer");
    Ok(())
}

/// Remove `finalizer`; the object is gone already when it was the last one
pub(crate) async fn remove_finalizer<S, K>(store: &S, obj: &K, finalizer: &str) -> Result<()>
where
    S: ObjectStore,
    K: StoreObject,
{
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    match store
        .merge_patch::<K>(
            obj.namespace().as_deref(),
            &obj.name_any(),
            &finalizer_patch(obj, finalizers),
        )
        .await
    {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    debug!(name = %obj.name_any(), finalizer, "removed finalizer");
    Ok(())
}
