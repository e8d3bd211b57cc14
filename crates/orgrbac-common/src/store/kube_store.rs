//! ObjectStore backed by the Kubernetes API

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::debug;

use super::{object_ref, ObjectStore, StoreObject};
use crate::crd::LabelSelector;
use crate::{Error, KindRegistry, ObjectKind, Result, FIELD_MANAGER};

/// Store that talks to the API server through `DynamicObject` APIs
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: Arc<KindRegistry>,
}

impl KubeStore {
    /// Create a store using the given client and kind registry
    pub fn new(client: Client, registry: Arc<KindRegistry>) -> Self {
        Self { client, registry }
    }

    fn api<K: StoreObject>(&self, namespace: Option<&str>) -> (Api<DynamicObject>, ApiResource) {
        let ar = self.registry.get(K::KIND);
        let api = match namespace {
            Some(ns) if K::KIND.namespaced() => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        };
        (api, ar)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Classify an API error for the object it concerns
fn map_api_error(kind: ObjectKind, name: String, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind.kind_str(), name),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(kind.kind_str(), name)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind.kind_str(), name),
        _ => Error::from(err),
    }
}

fn to_dynamic<K: StoreObject>(obj: &K, ar: &ApiResource) -> Result<DynamicObject> {
    let mut value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::KIND.kind_str(), e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".to_string(), Value::String(ar.api_version.clone()));
        map.insert("kind".to_string(), Value::String(ar.kind.clone()));
    }
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::KIND.kind_str(), e.to_string()))
}

fn from_dynamic<K: StoreObject>(obj: DynamicObject) -> Result<K> {
    let mut value = serde_json::to_value(&obj)
        .map_err(|e| Error::serialization_for_kind(K::KIND.kind_str(), e.to_string()))?;
    // Typed k8s-openapi objects only accept their compiled-in apiVersion
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "apiVersion".to_string(),
            Value::String(K::api_version(&()).into_owned()),
        );
        map.insert("kind".to_string(), Value::String(K::kind(&()).into_owned()));
    }
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::KIND.kind_str(), e.to_string()))
}

fn name_of<K: StoreObject>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            Error::validation_for(K::KIND.kind_str(), "object has no metadata.name")
        })
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let (api, _) = self.api::<K>(namespace);
        match api.get_opt(name).await {
            Ok(Some(obj)) => from_dynamic(obj).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(map_api_error(K::KIND, object_ref(namespace, name), e)),
        }
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>> {
        let (api, _) = self.api::<K>(namespace);
        let query = selector.to_query();
        let mut params = ListParams::default();
        if !query.is_empty() {
            params = params.labels(&query);
        }

        let list = api
            .list(&params)
            .await
            .map_err(|e| map_api_error(K::KIND, namespace.unwrap_or("*").to_string(), e))?;
        debug!(kind = %K::KIND, selector = %query, count = list.items.len(), "listed objects");
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let name = name_of(obj)?;
        let namespace = obj.namespace();
        let (api, ar) = self.api::<K>(namespace.as_deref());
        let dynamic = to_dynamic(obj, &ar)?;
        let created = api
            .create(&post_params(), &dynamic)
            .await
            .map_err(|e| map_api_error(K::KIND, object_ref(namespace.as_deref(), &name), e))?;
        from_dynamic(created)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let name = name_of(obj)?;
        let namespace = obj.namespace();
        let (api, ar) = self.api::<K>(namespace.as_deref());
        let dynamic = to_dynamic(obj, &ar)?;
        let updated = api
            .replace(&name, &post_params(), &dynamic)
            .await
            .map_err(|e| map_api_error(K::KIND, object_ref(namespace.as_deref(), &name), e))?;
        from_dynamic(updated)
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let (api, _) = self.api::<K>(namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_api_error(K::KIND, object_ref(namespace, name), e))
    }

    async fn merge_patch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        let (api, _) = self.api::<K>(namespace);
        let patched = api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| map_api_error(K::KIND, object_ref(namespace, name), e))?;
        from_dynamic(patched)
    }

    async fn merge_patch_status<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        let (api, _) = self.api::<K>(namespace);
        let patched = api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| map_api_error(K::KIND, object_ref(namespace, name), e))?;
        from_dynamic(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    fn binding() -> RoleBinding {
        RoleBinding {
            metadata: ObjectMeta {
                name: Some("admins".to_string()),
                namespace: Some("org-acme".to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: crate::RBAC_API_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: "cluster-admin".to_string(),
            },
            subjects: None,
        }
    }

    #[test]
    fn api_errors_are_classified() {
        let kind = ObjectKind::RoleBinding;
        assert!(map_api_error(kind, "a".into(), api_error(404, "NotFound")).is_not_found());
        assert!(
            map_api_error(kind, "a".into(), api_error(409, "AlreadyExists")).is_already_exists()
        );
        assert!(map_api_error(kind, "a".into(), api_error(409, "Conflict")).is_conflict());
        assert!(matches!(
            map_api_error(kind, "a".into(), api_error(500, "InternalError")),
            Error::Kube { .. }
        ));
    }

    #[test]
    fn typed_objects_convert_through_dynamic() {
        let registry = KindRegistry::hardcoded_defaults();
        let ar = registry.get(ObjectKind::RoleBinding);
        let dynamic = to_dynamic(&binding(), &ar).unwrap();
        assert_eq!(dynamic.types.as_ref().unwrap().kind, "RoleBinding");
        assert_eq!(dynamic.metadata.namespace.as_deref(), Some("org-acme"));
        assert_eq!(dynamic.data["roleRef"]["name"], "cluster-admin");

        let back: RoleBinding = from_dynamic(dynamic).unwrap();
        assert_eq!(back, binding());
    }

    #[test]
    fn unnamed_objects_are_rejected() {
        let mut rb = binding();
        rb.metadata.name = None;
        assert!(matches!(name_of(&rb), Err(Error::Validation { .. })));
    }
}
