//! In-memory ObjectStore for tests
//!
//! Mirrors the API server behavior the engines depend on: resourceVersion
//! conflicts, AlreadyExists on create, finalizer-gated deletion, generation
//! bumps on spec changes and a status subresource for the CRD kinds. Every
//! write is counted per kind so tests can assert that a converged pass
//! writes nothing.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{object_ref, ObjectStore, StoreObject};
use crate::crd::LabelSelector;
use crate::{Error, ObjectKind, Result};

/// Store operation, used for write counting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StoreOp {
    /// get
    Get,
    /// list
    List,
    /// create
    Create,
    /// update
    Update,
    /// delete
    Delete,
    /// merge_patch
    Patch,
    /// merge_patch_status
    PatchStatus,
}

impl StoreOp {
    fn is_write(&self) -> bool {
        !matches!(self, StoreOp::Get | StoreOp::List)
    }
}

/// Error returned by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedError {
    /// [`Error::Conflict`]
    Conflict,
    /// [`Error::AlreadyExists`]
    AlreadyExists,
    /// A retryable [`Error::Internal`]
    Unavailable,
}

#[derive(Debug, Clone)]
struct Fault {
    kind: ObjectKind,
    op: StoreOp,
    namespace: Option<String>,
    error: InjectedError,
    remaining: Option<usize>,
}

type Key = (ObjectKind, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    next_version: u64,
    writes: BTreeMap<(ObjectKind, StoreOp), usize>,
    faults: Vec<Fault>,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_fault(
        &mut self,
        kind: ObjectKind,
        op: StoreOp,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<Error> {
        let idx = self.faults.iter().position(|f| {
            f.kind == kind
                && f.op == op
                && f.namespace
                    .as_deref()
                    .is_none_or(|ns| Some(ns) == namespace)
        })?;
        let fault = &mut self.faults[idx];
        let error = fault.error;
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(idx);
            }
        }

        let target = object_ref(namespace, name);
        Some(match error {
            InjectedError::Conflict => Error::conflict(kind.kind_str(), target),
            InjectedError::AlreadyExists => Error::already_exists(kind.kind_str(), target),
            InjectedError::Unavailable => {
                Error::internal_with_context("memory-store", format!("{} unavailable", target))
            }
        })
    }

    fn record(&mut self, kind: ObjectKind, op: StoreOp) {
        if op.is_write() {
            *self.writes.entry((kind, op)).or_default() += 1;
        }
    }

    /// Store `value` under `key`, or drop it when deletion is pending and no
    /// finalizer remains
    fn commit(&mut self, key: Key, mut value: Value) {
        let deleting = !value["metadata"]["deletionTimestamp"].is_null();
        let finalizers_left = value["metadata"]["finalizers"]
            .as_array()
            .is_some_and(|f| !f.is_empty());
        if deleting && !finalizers_left {
            self.objects.remove(&key);
            return;
        }
        value["metadata"]["resourceVersion"] = json!(self.bump_version());
        self.objects.insert(key, value);
    }
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn key_for<K: StoreObject>(namespace: Option<&str>, name: &str) -> Key {
    let ns = if K::KIND.namespaced() {
        namespace.unwrap_or_default().to_string()
    } else {
        String::new()
    };
    (K::KIND, ns, name.to_string())
}

fn has_status_subresource(kind: ObjectKind) -> bool {
    matches!(
        kind,
        ObjectKind::Organization | ObjectKind::RoleBindingTemplate | ObjectKind::Namespace
    )
}

fn encode<K: StoreObject>(obj: &K) -> Result<Value> {
    let mut value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::KIND.kind_str(), e.to_string()))?;
    value["apiVersion"] = json!(K::api_version(&()));
    value["kind"] = json!(K::kind(&()));
    if value.get("metadata").is_none_or(|m| m.is_null()) {
        value["metadata"] = json!({});
    }
    Ok(value)
}

fn decode<K: StoreObject>(value: &Value) -> Result<K> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::serialization_for_kind(K::KIND.kind_str(), e.to_string()))
}

fn labels_of(value: &Value) -> BTreeMap<String, String> {
    value["metadata"]["labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// RFC 7386 JSON merge patch
pub(crate) fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch_map) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Some(target_map) = target.as_object_mut() {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                apply_merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting a write; assigns uid and version
    pub fn insert<K: StoreObject>(&self, obj: &K) -> K {
        let mut state = self.state.lock();
        let mut value = encode(obj).unwrap_or_else(|_| json!({ "metadata": {} }));
        let name = obj.meta().name.clone().unwrap_or_default();
        let namespace = obj.meta().namespace.clone();
        if value["metadata"]["uid"].is_null() {
            let uid = format!("uid-{}", state.bump_version());
            value["metadata"]["uid"] = json!(uid);
        }
        if value["metadata"]["generation"].is_null() {
            value["metadata"]["generation"] = json!(1);
        }
        let key = key_for::<K>(namespace.as_deref(), &name);
        value["metadata"]["resourceVersion"] = json!(state.bump_version());
        state.objects.insert(key, value.clone());
        serde_json::from_value(value).unwrap_or_else(|_| obj.clone())
    }

    /// Read an object directly, bypassing fault injection
    pub fn peek<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.state.lock();
        state
            .objects
            .get(&key_for::<K>(namespace, name))
            .and_then(|v| decode(v).ok())
    }

    /// All objects of a kind
    pub fn all<K: StoreObject>(&self) -> Vec<K> {
        let state = self.state.lock();
        state
            .objects
            .iter()
            .filter(|((kind, _, _), _)| *kind == K::KIND)
            .filter_map(|(_, v)| decode(v).ok())
            .collect()
    }

    /// Writes recorded for a kind
    pub fn writes(&self, kind: ObjectKind) -> usize {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, n)| n)
            .sum()
    }

    /// Writes recorded for a kind and operation
    pub fn writes_of(&self, kind: ObjectKind, op: StoreOp) -> usize {
        self.state
            .lock()
            .writes
            .get(&(kind, op))
            .copied()
            .unwrap_or_default()
    }

    /// Writes recorded across all kinds
    pub fn total_writes(&self) -> usize {
        self.state.lock().writes.values().sum()
    }

    /// Forget recorded writes
    pub fn reset_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Fail every matching operation until [`MemoryStore::clear_faults`]
    ///
    /// `namespace: None` matches any namespace.
    pub fn fail_always(
        &self,
        kind: ObjectKind,
        op: StoreOp,
        namespace: Option<&str>,
        error: InjectedError,
    ) {
        self.push_fault(kind, op, namespace, error, None);
    }

    /// Fail the next `times` matching operations
    pub fn fail_times(
        &self,
        kind: ObjectKind,
        op: StoreOp,
        namespace: Option<&str>,
        error: InjectedError,
        times: usize,
    ) {
        if times > 0 {
            self.push_fault(kind, op, namespace, error, Some(times));
        }
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    fn push_fault(
        &self,
        kind: ObjectKind,
        op: StoreOp,
        namespace: Option<&str>,
        error: InjectedError,
        remaining: Option<usize>,
    ) {
        self.state.lock().faults.push(Fault {
            kind,
            op,
            namespace: namespace.map(str::to_string),
            error,
            remaining,
        });
    }

    /// Mutate a stored object in place as another writer would (bumps the
    /// resourceVersion, counts no write)
    pub fn touch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        mutate: impl FnOnce(&mut Value),
    ) {
        let mut state = self.state.lock();
        let key = key_for::<K>(namespace, name);
        if let Some(mut value) = state.objects.get(&key).cloned() {
            mutate(&mut value);
            state.commit(key, value);
        }
    }

    fn patch_object<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
        op: StoreOp,
    ) -> Result<K> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(K::KIND, op, namespace, name) {
            return Err(err);
        }
        let key = key_for::<K>(namespace, name);
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(K::KIND.kind_str(), object_ref(namespace, name)));
        };

        let mut updated = current.clone();
        if op == StoreOp::PatchStatus {
            if let Some(status_patch) = patch.get("status") {
                let mut status = current.get("status").cloned().unwrap_or(json!({}));
                apply_merge_patch(&mut status, status_patch);
                updated["status"] = status;
            }
        } else {
            apply_merge_patch(&mut updated, patch);
            if has_status_subresource(K::KIND) {
                updated["status"] = current["status"].clone();
            }
            if updated["spec"] != current["spec"] {
                let generation = current["metadata"]["generation"].as_i64().unwrap_or(1);
                updated["metadata"]["generation"] = json!(generation + 1);
            }
        }

        state.record(K::KIND, op);
        state.commit(key, updated.clone());
        let stored = state.objects.get(&key_for::<K>(namespace, name)).cloned();
        decode(&stored.unwrap_or(updated))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(K::KIND, StoreOp::Get, namespace, name) {
            return Err(err);
        }
        state
            .objects
            .get(&key_for::<K>(namespace, name))
            .map(decode)
            .transpose()
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(K::KIND, StoreOp::List, namespace, "*") {
            return Err(err);
        }
        state
            .objects
            .iter()
            .filter(|((kind, ns, _), _)| {
                *kind == K::KIND
                    && (!K::KIND.namespaced() || namespace.is_none_or(|want| want == ns))
            })
            .filter(|(_, value)| selector.matches(&labels_of(value)))
            .map(|(_, value)| decode(value))
            .collect()
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let namespace = obj.meta().namespace.clone();
        let namespace = namespace.as_deref();
        if name.is_empty() {
            return Err(Error::validation_for(
                K::KIND.kind_str(),
                "object has no metadata.name",
            ));
        }

        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(K::KIND, StoreOp::Create, namespace, &name) {
            return Err(err);
        }
        let key = key_for::<K>(namespace, &name);
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(
                K::KIND.kind_str(),
                object_ref(namespace, &name),
            ));
        }

        let mut value = encode(obj)?;
        let uid = format!("uid-{}", state.bump_version());
        value["metadata"]["uid"] = json!(uid);
        value["metadata"]["generation"] = json!(1);
        state.record(K::KIND, StoreOp::Create);
        state.commit(key.clone(), value);
        state
            .objects
            .get(&key)
            .map(decode)
            .transpose()?
            .ok_or_else(|| Error::internal_with_context("memory-store", "created object vanished"))
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let namespace = obj.meta().namespace.clone();
        let namespace = namespace.as_deref();

        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(K::KIND, StoreOp::Update, namespace, &name) {
            return Err(err);
        }
        let key = key_for::<K>(namespace, &name);
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(K::KIND.kind_str(), object_ref(namespace, &name)));
        };

        let stored_version = current["metadata"]["resourceVersion"].as_str();
        if let Some(version) = obj.meta().resource_version.as_deref() {
            if Some(version) != stored_version {
                return Err(Error::conflict(K::KIND.kind_str(), object_ref(namespace, &name)));
            }
        }

        let mut value = encode(obj)?;
        value["metadata"]["uid"] = current["metadata"]["uid"].clone();
        value["metadata"]["deletionTimestamp"] = current["metadata"]["deletionTimestamp"].clone();
        if has_status_subresource(K::KIND) {
            value["status"] = current["status"].clone();
        }
        let generation = current["metadata"]["generation"].as_i64().unwrap_or(1);
        let spec_changed = value["spec"] != current["spec"];
        value["metadata"]["generation"] =
            json!(if spec_changed { generation + 1 } else { generation });

        state.record(K::KIND, StoreOp::Update);
        state.commit(key.clone(), value.clone());
        let stored = state.objects.get(&key).cloned();
        decode(&stored.unwrap_or(value))
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(K::KIND, StoreOp::Delete, namespace, name) {
            return Err(err);
        }
        let key = key_for::<K>(namespace, name);
        let Some(mut value) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(K::KIND.kind_str(), object_ref(namespace, name)));
        };

        state.record(K::KIND, StoreOp::Delete);
        if value["metadata"]["deletionTimestamp"].is_null() {
            value["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
        }
        state.commit(key, value);
        Ok(())
    }

    async fn merge_patch<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        self.patch_object(namespace, name, patch, StoreOp::Patch)
    }

    async fn merge_patch_status<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        self.patch_object(namespace, name, patch, StoreOp::PatchStatus)
    }
}
