//! Controller runner: builds the controller futures the binary drives

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use orgrbac_common::crd::{Organization, RoleBindingTemplate};
use orgrbac_common::{KubeStore, CLUSTER_LABEL, ORGANIZATION_LABEL};

use crate::controller::{error_policy, organization, template};
use crate::Context;

/// Watcher timeout (seconds), kept below the client read timeout (30s) so the
/// API server closes idle watches first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller loop ready to be awaited
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the RoleBindingTemplate controller
///
/// Every namespace or organization change can move template scopes, so both
/// enqueue all known templates. Derived bindings are watched through their
/// owner reference.
pub fn build_template_controller(client: Client, ctx: Arc<Context<KubeStore>>) -> ControllerFuture {
    let templates: Api<RoleBindingTemplate> = Api::all(client.clone());
    let controller = Controller::new(templates, watcher_config());
    let on_namespace = controller.store();
    let on_organization = on_namespace.clone();

    tracing::info!("- RoleBindingTemplate controller");

    Box::pin(
        controller
            .owns(Api::<RoleBinding>::all(client.clone()), watcher_config())
            .watches(
                Api::<Namespace>::all(client.clone()),
                watcher_config(),
                move |_: Namespace| all_templates(&on_namespace),
            )
            .watches(
                Api::<Organization>::all(client),
                watcher_config(),
                move |_: Organization| all_templates(&on_organization),
            )
            .shutdown_on_signal()
            .run(
                template::reconcile::<KubeStore>,
                error_policy::<RoleBindingTemplate, KubeStore>,
                ctx,
            )
            .for_each(log_reconcile_result("RoleBindingTemplate")),
    )
}

/// Build the Organization controller
///
/// Bindings in an organization namespace are propagation sources; derived
/// objects point back at their organization through owner references.
/// Namespace changes reach the organization named by their label and the one
/// owning the namespace; cluster namespace changes reach every organization.
pub fn build_organization_controller(
    client: Client,
    ctx: Arc<Context<KubeStore>>,
) -> ControllerFuture {
    let organizations: Api<Organization> = Api::all(client.clone());
    let controller = Controller::new(organizations, watcher_config());
    let on_binding = controller.store();
    let on_namespace = on_binding.clone();

    tracing::info!("- Organization controller");

    Box::pin(
        controller
            .watches(
                Api::<RoleBinding>::all(client.clone()),
                watcher_config(),
                move |rb: RoleBinding| organizations_for_binding(&on_binding, &rb),
            )
            .watches(
                Api::<Namespace>::all(client),
                watcher_config(),
                move |ns: Namespace| organizations_for_namespace(&on_namespace, &ns),
            )
            .shutdown_on_signal()
            .run(
                organization::reconcile::<KubeStore>,
                error_policy::<Organization, KubeStore>,
                ctx,
            )
            .for_each(log_reconcile_result("Organization")),
    )
}

fn all_templates(store: &Store<RoleBindingTemplate>) -> Vec<ObjectRef<RoleBindingTemplate>> {
    store
        .state()
        .iter()
        .map(|t| ObjectRef::from_obj(t.as_ref()))
        .collect()
}

/// Organizations owning the namespace `namespace`
fn organizations_owning(store: &Store<Organization>, namespace: &str) -> Vec<ObjectRef<Organization>> {
    store
        .state()
        .iter()
        .filter(|org| org.owned_namespace() == Some(namespace))
        .map(|org| ObjectRef::from_obj(org.as_ref()))
        .collect()
}

fn organizations_for_binding(
    store: &Store<Organization>,
    rb: &RoleBinding,
) -> Vec<ObjectRef<Organization>> {
    let org_kind = Organization::kind(&());
    let mut refs: Vec<ObjectRef<Organization>> = rb
        .owner_references()
        .iter()
        .filter(|o| o.kind == org_kind)
        .map(|o| ObjectRef::new(&o.name))
        .collect();
    if let Some(ns) = rb.namespace() {
        refs.extend(organizations_owning(store, &ns));
    }
    refs
}

fn organizations_for_namespace(
    store: &Store<Organization>,
    ns: &Namespace,
) -> Vec<ObjectRef<Organization>> {
    // a cluster namespace may just have moved away from its previous
    // organization, which is not visible from the new labels
    if ns.labels().contains_key(CLUSTER_LABEL) {
        return store
            .state()
            .iter()
            .map(|org| ObjectRef::from_obj(org.as_ref()))
            .collect();
    }
    let mut refs = organizations_owning(store, &ns.name_any());
    if let Some(org) = ns.labels().get(ORGANIZATION_LABEL) {
        refs.push(ObjectRef::new(org));
    }
    refs
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
