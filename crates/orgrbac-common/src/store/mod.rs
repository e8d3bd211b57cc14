//! Object store abstraction
//!
//! Engines read and write cluster state only through [`ObjectStore`]. The
//! production implementation is [`KubeStore`]; tests use the in-memory
//! `MemoryStore` behind the `test-utils` feature.

mod kube_store;
#[cfg(any(test, feature = "test-utils"))]
mod memory;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::crd::{LabelSelector, Organization, RoleBindingTemplate};
use crate::{Error, ObjectKind, Result};

pub use kube_store::KubeStore;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{InjectedError, MemoryStore, StoreOp};

/// A Kubernetes object type the store can address
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Registry kind of this type
    const KIND: ObjectKind;
}

impl StoreObject for Namespace {
    const KIND: ObjectKind = ObjectKind::Namespace;
}

impl StoreObject for Organization {
    const KIND: ObjectKind = ObjectKind::Organization;
}

impl StoreObject for RoleBindingTemplate {
    const KIND: ObjectKind = ObjectKind::RoleBindingTemplate;
}

impl StoreObject for Role {
    const KIND: ObjectKind = ObjectKind::Role;
}

impl StoreObject for RoleBinding {
    const KIND: ObjectKind = ObjectKind::RoleBinding;
}

/// Read and write access to cluster objects
///
/// `namespace` is ignored for cluster-scoped kinds. For `list`, `None` lists
/// across all namespaces.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object, `None` when it does not exist
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// List objects matching a label selector
    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>>;

    /// Create an object; fails with [`Error::AlreadyExists`] on a name clash
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Replace an object; fails with [`Error::Conflict`] when its resourceVersion is stale
    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Delete an object; fails with [`Error::NotFound`] when it is already gone
    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Apply a JSON merge patch to an object
    async fn merge_patch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K>;

    /// Apply a JSON merge patch to the status subresource of an object
    async fn merge_patch_status<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K>;
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for Arc<S> {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        self.as_ref().get(namespace, name).await
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>> {
        self.as_ref().list(namespace, selector).await
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        self.as_ref().create(obj).await
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        self.as_ref().update(obj).await
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        self.as_ref().delete::<K>(namespace, name).await
    }

    async fn merge_patch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        self.as_ref().merge_patch(namespace, name, patch).await
    }

    async fn merge_patch_status<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        self.as_ref().merge_patch_status(namespace, name, patch).await
    }
}

/// `namespace/name` for namespaced objects, `name` otherwise
pub fn object_ref(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Store wrapper that refuses further calls once its token is cancelled.
///
/// A pass in flight stops at its next store call with [`Error::Cancelled`]
/// and leaves no partially-written object behind.
pub struct CancellableStore<S> {
    inner: S,
    token: CancellationToken,
}

impl<S: ObjectStore> CancellableStore<S> {
    /// Wrap a store
    pub fn new(inner: S, token: CancellationToken) -> Self {
        Self { inner, token }
    }

    /// The wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for CancellableStore<S> {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        self.check()?;
        self.inner.get(namespace, name).await
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>> {
        self.check()?;
        self.inner.list(namespace, selector).await
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        self.check()?;
        self.inner.create(obj).await
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        self.check()?;
        self.inner.update(obj).await
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        self.check()?;
        self.inner.delete::<K>(namespace, name).await
    }

    async fn merge_patch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        self.check()?;
        self.inner.merge_patch(namespace, name, patch).await
    }

    async fn merge_patch_status<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        self.check()?;
        self.inner.merge_patch_status(namespace, name, patch).await
    }
}
