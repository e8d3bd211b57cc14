//! Reconciliation primitive for derived RBAC objects
//!
//! `ensure` makes one object match its desired form with the fewest writes:
//! create when absent, update only when the compared entries differ, and
//! recreate RoleBindings whose immutable roleRef changed. Existing objects
//! controlled by someone else, or authored outside the operator, are never
//! touched.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use orgrbac_common::store::object_ref;
use orgrbac_common::{Error, ObjectStore, Result, StoreObject, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use tracing::{debug, info, warn};

/// Result of [`ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The object did not exist and was created
    Created,
    /// The compared entries (or adoption metadata) were rewritten
    Updated,
    /// The object was deleted and created again
    Recreated,
    /// Nothing was written
    Unchanged,
}

/// Result of [`delete_owned`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object was deleted
    Deleted,
    /// There was nothing to delete
    Absent,
    /// The object exists but belongs to someone else; left alone
    NotOwned,
}

/// An RBAC kind with a conservatively compared set of entries
pub trait Reconcilable: StoreObject {
    /// Number of compared entries
    fn entry_count(&self) -> usize;

    /// Whether the compared entries equal those of `desired`
    fn entries_match(&self, desired: &Self) -> bool;

    /// Overwrite the compared entries with those of `desired`
    fn copy_entries(&mut self, desired: &Self);

    /// Whether an immutable field differs so that only delete-and-create converges
    fn needs_recreate(&self, _desired: &Self) -> bool {
        false
    }
}

impl Reconcilable for RoleBinding {
    fn entry_count(&self) -> usize {
        self.subjects.as_ref().map_or(0, Vec::len)
    }

    fn entries_match(&self, desired: &Self) -> bool {
        self.subjects.as_deref().unwrap_or_default() == desired.subjects.as_deref().unwrap_or_default()
    }

    fn copy_entries(&mut self, desired: &Self) {
        self.subjects = desired.subjects.clone();
    }

    fn needs_recreate(&self, desired: &Self) -> bool {
        self.role_ref != desired.role_ref
    }
}

impl Reconcilable for Role {
    fn entry_count(&self) -> usize {
        self.rules.as_ref().map_or(0, Vec::len)
    }

    fn entries_match(&self, desired: &Self) -> bool {
        self.rules.as_deref().unwrap_or_default() == desired.rules.as_deref().unwrap_or_default()
    }

    fn copy_entries(&mut self, desired: &Self) {
        self.rules = desired.rules.clone();
    }
}

/// The controller owner reference of an object, if any
pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true))
}

fn required_owner<K: StoreObject>(desired: &K) -> Result<OwnerReference> {
    let target = object_ref(desired.meta().namespace.as_deref(), &desired.name_any());
    match controller_of(desired) {
        Some(r) if !r.uid.is_empty() && !r.name.is_empty() => Ok(r.clone()),
        Some(_) => Err(Error::validation_for(
            target,
            "controller owner reference needs a uid and a name",
        )),
        None => Err(Error::validation_for(
            target,
            "derived object has no controller owner reference",
        )),
    }
}

/// Make the stored object match `desired`
///
/// `desired` must carry a controller owner reference with a uid and a name.
/// Conflicts are retried up to `max_conflict_retries` times against a fresh
/// read before they surface.
pub async fn ensure<S, K>(store: &S, desired: &K, max_conflict_retries: u32) -> Result<Outcome>
where
    S: ObjectStore,
    K: Reconcilable,
{
    let owner = required_owner(desired)?;
    ensure_with(store, desired, Some(&owner), max_conflict_retries).await
}

/// Make a shared object match `desired` without ownership
///
/// Used for objects several owners rely on; no controller reference is
/// checked or added, and the object outlives any single owner.
pub async fn ensure_shared<S, K>(store: &S, desired: &K, max_conflict_retries: u32) -> Result<Outcome>
where
    S: ObjectStore,
    K: Reconcilable,
{
    ensure_with(store, desired, None, max_conflict_retries).await
}

async fn ensure_with<S, K>(
    store: &S,
    desired: &K,
    owner: Option<&OwnerReference>,
    max_conflict_retries: u32,
) -> Result<Outcome>
where
    S: ObjectStore,
    K: Reconcilable,
{
    let mut attempt = 0;
    loop {
        match ensure_once(store, desired, owner).await {
            Err(e) if e.is_conflict() && attempt < max_conflict_retries => {
                attempt += 1;
                debug!(
                    kind = %K::KIND,
                    object = %object_ref(desired.meta().namespace.as_deref(), &desired.name_any()),
                    attempt,
                    "conflict, retrying against a fresh read"
                );
            }
            other => return other,
        }
    }
}

async fn ensure_once<S, K>(store: &S, desired: &K, owner: Option<&OwnerReference>) -> Result<Outcome>
where
    S: ObjectStore,
    K: Reconcilable,
{
    let name = desired.name_any();
    let namespace = desired.meta().namespace.clone();
    let ns = namespace.as_deref();

    let Some(existing) = store.get::<K>(ns, &name).await? else {
        return match store.create(desired).await {
            Ok(_) => {
                info!(kind = %K::KIND, object = %object_ref(ns, &name), "created");
                Ok(Outcome::Created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(kind = %K::KIND, object = %object_ref(ns, &name), "created concurrently");
                Ok(Outcome::Unchanged)
            }
            Err(e) => Err(e),
        };
    };

    let ownership_error = |owner: String| Error::Ownership {
        kind: K::KIND.kind_str().to_string(),
        namespace: ns.unwrap_or_default().to_string(),
        name: name.clone(),
        owner,
    };
    let adopt = match (owner, controller_of(&existing)) {
        (Some(owner), Some(current)) if current.uid == owner.uid => false,
        (Some(_), Some(current)) => {
            return Err(ownership_error(format!("{}/{}", current.kind, current.name)));
        }
        // objects nobody controls are only taken over when they were derived
        // by the operator in the first place
        (_, None) if !is_managed(&existing) => {
            return Err(ownership_error(UNMANAGED_OWNER.to_string()));
        }
        (None, _) => false,
        (Some(_), None) => true,
    };

    if existing.needs_recreate(desired) {
        match store.delete::<K>(ns, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        return match store.create(desired).await {
            Ok(_) => {
                info!(kind = %K::KIND, object = %object_ref(ns, &name), "recreated");
                Ok(Outcome::Recreated)
            }
            // someone recreated it first; re-read and compare on the next attempt
            Err(e) if e.is_already_exists() => Err(Error::conflict(
                K::KIND.kind_str(),
                object_ref(ns, &name),
            )),
            Err(e) => Err(e),
        };
    }

    let entries_stale =
        !existing.entries_match(desired) || (existing.entry_count() == 0 && desired.entry_count() > 0);
    if !entries_stale && !adopt {
        return Ok(Outcome::Unchanged);
    }

    let mut updated = existing.clone();
    updated.copy_entries(desired);
    if adopt {
        adopt_into(&mut updated, desired, owner);
    }
    store.update(&updated).await?;
    info!(kind = %K::KIND, object = %object_ref(ns, &name), adopted = adopt, "updated");
    Ok(Outcome::Updated)
}

/// Owner reported for existing objects the operator did not derive
pub const UNMANAGED_OWNER: &str = "an unmanaged author";

fn is_managed<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY_LABEL))
        .is_some_and(|v| v == MANAGED_BY_VALUE)
}

fn adopt_into<K: Resource>(obj: &mut K, desired: &K, owner: Option<&OwnerReference>) {
    if let Some(owner) = owner {
        obj.meta_mut()
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(owner.clone());
    }
    let labels = obj.meta_mut().labels.get_or_insert_with(BTreeMap::new);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    for (k, v) in desired.meta().labels.iter().flatten() {
        labels.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Delete an object if its controller owner has uid `owner_uid`
pub async fn delete_owned<S, K>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
    owner_uid: &str,
) -> Result<DeleteOutcome>
where
    S: ObjectStore,
    K: StoreObject,
{
    let Some(existing) = store.get::<K>(namespace, name).await? else {
        return Ok(DeleteOutcome::Absent);
    };
    if controller_of(&existing).is_none_or(|r| r.uid != owner_uid) {
        debug!(kind = %K::KIND, object = %object_ref(namespace, name), "not owned, leaving in place");
        return Ok(DeleteOutcome::NotOwned);
    }
    match store.delete::<K>(namespace, name).await {
        Ok(()) => {
            info!(kind = %K::KIND, object = %object_ref(namespace, name), "deleted");
            Ok(DeleteOutcome::Deleted)
        }
        Err(e) if e.is_not_found() => Ok(DeleteOutcome::Absent),
        Err(e) => Err(e),
    }
}

/// A cleanup target that could not be removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// `namespace/name` of the object
    pub target: String,
    /// Error message
    pub error: String,
}

/// Accumulated outcome of a best-effort cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Objects that were deleted
    pub removed: Vec<String>,
    /// Objects left in place because another owner controls them
    pub skipped: Vec<String>,
    /// Objects whose deletion failed
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Record the result of deleting `target`
    pub fn record(&mut self, target: String, result: Result<DeleteOutcome>) {
        match result {
            Ok(DeleteOutcome::Deleted) => self.removed.push(target),
            Ok(DeleteOutcome::Absent) => {}
            Ok(DeleteOutcome::NotOwned) => self.skipped.push(target),
            Err(e) => self.record_failure(target, &e),
        }
    }

    /// Record a failure for `target`
    pub fn record_failure(&mut self, target: String, error: &Error) {
        warn!(target = %target, error = %error, "cleanup failed");
        self.failures.push(CleanupFailure {
            target,
            error: error.to_string(),
        });
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.skipped.extend(other.skipped);
        self.failures.extend(other.failures);
    }

    /// True when every target was handled
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Err(Partial)` listing the failed targets, if any
    pub fn into_result(self, context: impl Into<String>) -> Result<CleanupReport> {
        if self.is_clean() {
            return Ok(self);
        }
        Err(Error::Partial {
            context: context.into(),
            failed: self.failures.into_iter().map(|f| f.target).collect(),
        })
    }
}
