//! Convergence primitives
//!
//! Each call addresses exactly one object, forces the object's identity to
//! the given key first, and is safe to repeat on every reconcile. A 404 from
//! the store is absence, reported as `false`, never as an error.

use tracing::debug;

use weft_common::error::is_not_found;
use weft_common::Result;

use crate::key::ObjectKey;
use crate::kinds::{from_dynamic, to_dynamic, ManagedKind};
use crate::store::ObjectStore;

fn has_uid<K: ManagedKind>(obj: &K) -> bool {
    obj.meta().uid.as_deref().is_some_and(|uid| !uid.is_empty())
}

/// Create `obj` at `key` unless it was already created.
///
/// Returns `true` when a create call was issued. On success `obj` is replaced
/// with the server's copy, so it carries the new uid.
pub async fn create<K: ManagedKind>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    obj: &mut K,
) -> Result<bool> {
    key.apply_to(obj.meta_mut());
    if has_uid(obj) {
        return Ok(false);
    }
    let created = store.create(&K::api_resource(), &to_dynamic(obj)?).await?;
    *obj = from_dynamic(created)?;
    debug!(kind = %K::kind_name(), key = %key, "Created");
    Ok(true)
}

/// Create `obj` at `key`, or replace it if it already has a uid.
///
/// The update is unconditional: no comparison against the last observed
/// state is made, the API server decides whether anything changed.
pub async fn create_or_update<K: ManagedKind>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    obj: &mut K,
) -> Result<()> {
    if create(store, key, obj).await? {
        return Ok(());
    }
    let updated = store.update(&K::api_resource(), &to_dynamic(obj)?).await?;
    *obj = from_dynamic(updated)?;
    Ok(())
}

/// Fetch the object at `key` into `obj`.
///
/// Returns `false` if it does not exist; `obj` then keeps its contents with
/// its identity set to `key`, ready for a later [`create`].
pub async fn get_ignore_not_found<K: ManagedKind>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    obj: &mut K,
) -> Result<bool> {
    key.apply_to(obj.meta_mut());
    match store.get(&K::api_resource(), key).await {
        Ok(found) => {
            *obj = from_dynamic(found)?;
            Ok(true)
        }
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete `obj`. Returns `false` if it was already gone.
pub async fn delete_ignore_not_found<K: ManagedKind>(
    store: &dyn ObjectStore,
    obj: &K,
) -> Result<bool> {
    let key = ObjectKey::of(obj.meta());
    match store.delete(&K::api_resource(), &key).await {
        Ok(()) => {
            debug!(kind = %K::kind_name(), key = %key, "Deleted");
            Ok(true)
        }
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Merge-patch the status of the top-level object at `key`
pub async fn patch_status<K: ManagedKind>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    status: &impl serde::Serialize,
) -> Result<()> {
    let status = serde_json::to_value(status)?;
    store.patch_status(&K::api_resource(), key, &status).await?;
    Ok(())
}
