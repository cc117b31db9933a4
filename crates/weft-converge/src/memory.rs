//! In-memory `ObjectStore` for tests
//!
//! Behaves like a single API server for the calls the control plane makes:
//! uids and resource versions are assigned on create, duplicate creates get
//! a 409, missing objects a 404, stale updates a 409 conflict, and an update
//! that changes nothing keeps the resource version. Every mutating call is
//! recorded so tests can assert on write order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use crate::key::ObjectKey;
use crate::kinds::{from_dynamic, to_dynamic, ManagedKind};
use crate::store::ObjectStore;

/// Kind of recorded call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Create call
    Create,
    /// Replace call
    Update,
    /// Delete call
    Delete,
    /// Status patch
    PatchStatus,
}

/// One recorded mutating call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    /// What was done
    pub verb: Verb,
    /// Kind of the object
    pub kind: String,
    /// Object address
    pub key: ObjectKey,
    /// Whether the call changed stored state
    pub changed: bool,
}

type StoreKey = (String, String, Option<String>, String);

#[derive(Default)]
struct State {
    objects: HashMap<StoreKey, DynamicObject>,
    ops: Vec<Op>,
    next_version: u64,
    failures: HashMap<(Verb, String, String), u16>,
}

/// In-memory API server
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    populate_tokens: bool,
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

/// Reason the API server reports alongside `code` for `verb`
fn injected_reason(verb: Verb, code: u16) -> &'static str {
    match (verb, code) {
        (Verb::Create, 409) => "AlreadyExists",
        (_, 409) => "Conflict",
        (_, 404) => "NotFound",
        (_, 422) => "Invalid",
        (_, 429) => "TooManyRequests",
        (_, code) if code >= 500 => "InternalError",
        _ => "BadRequest",
    }
}

fn store_key(resource: &ApiResource, key: &ObjectKey) -> StoreKey {
    (
        resource.api_version.clone(),
        resource.kind.clone(),
        key.namespace.clone(),
        key.name.clone(),
    )
}

/// Fake bearer token placed into service-account token secrets
pub const FAKE_SERVICE_ACCOUNT_TOKEN: &str = "eyJhbGciOiJSUzI1NiJ9.fake-service-account-token.sig";

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Act as the token controller: service-account token secrets receive
    /// `data.token` as soon as they are created.
    pub fn with_token_controller(mut self) -> Self {
        self.populate_tokens = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed or overwrite a typed object without recording an operation
    pub fn insert<K: ManagedKind>(&self, obj: &K) -> K {
        let mut state = self.lock();
        let mut dynamic = to_dynamic(obj).unwrap_or_else(|e| panic!("seed object: {e}"));
        state.next_version += 1;
        dynamic.metadata.resource_version = Some(state.next_version.to_string());
        if dynamic.metadata.uid.is_none() {
            dynamic.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        let key = store_key(&K::api_resource(), &ObjectKey::of(&dynamic.metadata));
        state.objects.insert(key, dynamic.clone());
        from_dynamic(dynamic).unwrap_or_else(|e| panic!("seed object: {e}"))
    }

    /// Typed copy of the stored object at `key`
    pub fn get_typed<K: ManagedKind>(&self, key: &ObjectKey) -> Option<K> {
        let state = self.lock();
        let obj = state.objects.get(&store_key(&K::api_resource(), key))?.clone();
        from_dynamic(obj).ok()
    }

    /// Typed copies of every stored object of kind `K`
    pub fn list_typed<K: ManagedKind>(&self) -> Vec<K> {
        let resource = K::api_resource();
        let state = self.lock();
        let mut out: Vec<_> = state
            .objects
            .iter()
            .filter(|((api_version, kind, _, _), _)| {
                *api_version == resource.api_version && *kind == resource.kind
            })
            .filter_map(|(_, obj)| from_dynamic(obj.clone()).ok())
            .collect();
        out.sort_by_key(|o: &K| ObjectKey::of(o.meta()));
        out
    }

    /// Whether an object of kind `K` exists at `key`
    pub fn contains<K: ManagedKind>(&self, key: &ObjectKey) -> bool {
        self.lock()
            .objects
            .contains_key(&store_key(&K::api_resource(), key))
    }

    /// Recorded mutating calls, oldest first
    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    /// Recorded calls that changed stored state
    pub fn changes(&self) -> Vec<Op> {
        self.lock().ops.iter().filter(|op| op.changed).cloned().collect()
    }

    /// Forget recorded calls
    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Make the next `verb` on `kind`/`name` fail with HTTP `code`
    pub fn fail_next(&self, verb: Verb, kind: &str, name: &str, code: u16) {
        self.lock()
            .failures
            .insert((verb, kind.to_string(), name.to_string()), code);
    }

    fn take_failure(
        state: &mut State,
        verb: Verb,
        resource: &ApiResource,
        name: &str,
    ) -> Result<(), kube::Error> {
        match state
            .failures
            .remove(&(verb, resource.kind.clone(), name.to_string()))
        {
            Some(code) => Err(api_error(
                code,
                injected_reason(verb, code),
                format!("injected {verb:?} failure"),
            )),
            None => Ok(()),
        }
    }

    fn record(state: &mut State, verb: Verb, resource: &ApiResource, key: ObjectKey, changed: bool) {
        state.ops.push(Op {
            verb,
            kind: resource.kind.clone(),
            key,
            changed,
        });
    }

    fn populate_token(obj: &mut DynamicObject) {
        if obj.data.get("type").and_then(|t| t.as_str())
            != Some("kubernetes.io/service-account-token")
        {
            return;
        }
        let token = ByteString(FAKE_SERVICE_ACCOUNT_TOKEN.as_bytes().to_vec());
        let data = BTreeMap::from([("token".to_string(), token)]);
        if let Ok(value) = serde_json::to_value(data) {
            obj.data["data"] = value;
        }
    }

    /// Compare everything except server-managed metadata
    fn same_content(a: &DynamicObject, b: &DynamicObject) -> bool {
        let strip = |o: &DynamicObject| {
            let mut o = o.clone();
            o.metadata.resource_version = None;
            o.metadata.managed_fields = None;
            o.metadata.generation = None;
            o.types = None;
            o
        };
        let (a, b) = (strip(a), strip(b));
        a.metadata == b.metadata && a.data == b.data
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<DynamicObject, kube::Error> {
        self.lock()
            .objects
            .get(&store_key(resource, key))
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("{} {} not found", resource.kind, key)))
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let key = ObjectKey::of(&obj.metadata);
        let mut state = self.lock();
        Self::take_failure(&mut state, Verb::Create, resource, &key.name)?;
        let skey = store_key(resource, &key);
        if state.objects.contains_key(&skey) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} {} already exists", resource.kind, key),
            ));
        }

        let mut stored = obj.clone();
        state.next_version += 1;
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.resource_version = Some(state.next_version.to_string());
        stored.metadata.generation = Some(1);
        if self.populate_tokens && resource.kind == "Secret" {
            Self::populate_token(&mut stored);
        }
        state.objects.insert(skey, stored.clone());
        Self::record(&mut state, Verb::Create, resource, key, true);
        Ok(stored)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let key = ObjectKey::of(&obj.metadata);
        let mut state = self.lock();
        Self::take_failure(&mut state, Verb::Update, resource, &key.name)?;
        let skey = store_key(resource, &key);
        let Some(current) = state.objects.get(&skey).cloned() else {
            return Err(api_error(404, "NotFound", format!("{} {} not found", resource.kind, key)));
        };
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != current.metadata.resource_version
        {
            return Err(api_error(
                409,
                "Conflict",
                format!("{} {} has been modified", resource.kind, key),
            ));
        }

        let mut next = obj.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.resource_version = current.metadata.resource_version.clone();
        next.metadata.generation = current.metadata.generation;
        // Status is only writable through the status sub-resource
        match current.data.get("status") {
            Some(status) => next.data["status"] = status.clone(),
            None => {
                if let Some(map) = next.data.as_object_mut() {
                    map.remove("status");
                }
            }
        }

        if Self::same_content(&current, &next) {
            Self::record(&mut state, Verb::Update, resource, key, false);
            return Ok(current);
        }
        state.next_version += 1;
        next.metadata.resource_version = Some(state.next_version.to_string());
        next.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        state.objects.insert(skey, next.clone());
        Self::record(&mut state, Verb::Update, resource, key, true);
        Ok(next)
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<(), kube::Error> {
        let mut state = self.lock();
        Self::take_failure(&mut state, Verb::Delete, resource, &key.name)?;
        if state.objects.remove(&store_key(resource, key)).is_none() {
            return Err(api_error(404, "NotFound", format!("{} {} not found", resource.kind, key)));
        }
        Self::record(&mut state, Verb::Delete, resource, key.clone(), true);
        Ok(())
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, kube::Error> {
        let mut state = self.lock();
        Self::take_failure(&mut state, Verb::PatchStatus, resource, &key.name)?;
        state.next_version += 1;
        let version = state.next_version.to_string();
        let skey = store_key(resource, key);
        let Some(obj) = state.objects.get_mut(&skey) else {
            return Err(api_error(404, "NotFound", format!("{} {} not found", resource.kind, key)));
        };
        obj.data["status"] = status.clone();
        obj.metadata.resource_version = Some(version);
        let out = obj.clone();
        Self::record(&mut state, Verb::PatchStatus, resource, key.clone(), true);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn cm(data: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.data = Some(BTreeMap::from([("k".to_string(), data.to_string())]));
        cm
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced("ns", "cm")
    }

    #[tokio::test]
    async fn duplicate_create_is_already_exists() {
        let store = MemoryStore::new();
        store.insert(&{
            let mut c = cm("a");
            key().apply_to(&mut c.metadata);
            c
        });

        let mut fresh = cm("b");
        let err = ops::create(&store, &key(), &mut fresh).await.unwrap_err();
        match err {
            weft_common::Error::Kube { source } => {
                assert!(weft_common::error::is_already_exists(&source))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn no_op_update_keeps_resource_version() {
        let store = MemoryStore::new();
        let mut obj = cm("a");
        ops::create_or_update(&store, &key(), &mut obj).await.unwrap();
        let version = obj.metadata.resource_version.clone();

        ops::create_or_update(&store, &key(), &mut obj).await.unwrap();
        assert_eq!(obj.metadata.resource_version, version);
        assert_eq!(store.changes().len(), 1);
        assert_eq!(store.ops().len(), 2);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemoryStore::new();
        let mut first = cm("a");
        ops::create_or_update(&store, &key(), &mut first).await.unwrap();
        let mut stale = first.clone();

        first.data = Some(BTreeMap::from([("k".to_string(), "b".to_string())]));
        ops::create_or_update(&store, &key(), &mut first).await.unwrap();

        stale.data = Some(BTreeMap::from([("k".to_string(), "c".to_string())]));
        let err = ops::create_or_update(&store, &key(), &mut stale)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = MemoryStore::new();
        store.fail_next(Verb::Create, "ConfigMap", "cm", 500);

        let mut obj = cm("a");
        assert!(ops::create(&store, &key(), &mut obj).await.is_err());
        assert!(ops::create(&store, &key(), &mut obj).await.unwrap());
    }

    #[tokio::test]
    async fn injected_create_conflict_reads_as_already_exists() {
        let store = MemoryStore::new();
        store.fail_next(Verb::Create, "ConfigMap", "cm", 409);

        let mut obj = cm("a");
        match ops::create(&store, &key(), &mut obj).await.unwrap_err() {
            weft_common::Error::Kube { source } => {
                assert!(weft_common::error::is_already_exists(&source))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
