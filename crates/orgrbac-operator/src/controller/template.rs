//! RoleBindingTemplate controller

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use orgrbac_common::crd::RoleBindingTemplate;
use orgrbac_common::{Error, ObjectStore, TEMPLATE_FINALIZER};
use tracing::{info, instrument, warn};

use super::{add_finalizer, remove_finalizer};
use crate::Context;

/// Reconcile one RoleBindingTemplate
///
/// A template being deleted has its derived bindings removed and its
/// finalizer dropped, even when some deletions failed. Otherwise the
/// finalizer is ensured and the template is materialized.
#[instrument(skip(template, ctx), fields(template = %template.name_any()))]
pub async fn reconcile<S: ObjectStore>(
    template: Arc<RoleBindingTemplate>,
    ctx: Arc<Context<S>>,
) -> Result<Action, Error> {
    let store = ctx.pass_store();

    if template.metadata.deletion_timestamp.is_some() {
        let report = ctx.materializer.cleanup(&store, &template).await;
        if !report.is_clean() {
            warn!(
                failures = report.failures.len(),
                "removing finalizer with bindings left behind"
            );
        }
        remove_finalizer(&store, template.as_ref(), TEMPLATE_FINALIZER).await?;
        info!(removed = report.removed.len(), "template deleted");
        return Ok(Action::await_change());
    }

    add_finalizer(&store, template.as_ref(), TEMPLATE_FINALIZER).await?;
    let outcome = ctx.materializer.materialize(&store, &template).await?;
    info!(
        provisioned = outcome.provisioned.len(),
        removed = outcome.removed.len(),
        "template reconciled"
    );
    Ok(Action::requeue(ctx.config.requeue_interval))
}
