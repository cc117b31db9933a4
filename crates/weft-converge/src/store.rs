//! The object store seam between convergence logic and the cluster API
//!
//! Everything above this trait works on typed objects; the store itself only
//! sees `DynamicObject` plus the `ApiResource` describing its kind, which
//! keeps the trait object-safe and mockable.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use weft_common::FIELD_MANAGER;

use crate::key::ObjectKey;

/// Raw cluster API calls, addressed by namespace and name
///
/// Errors are returned unclassified. A missing object is a
/// `kube::Error::Api` with code 404; callers decide what absence means.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the object at `key`
    async fn get(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<DynamicObject, kube::Error>;

    /// Create `obj`; its metadata carries the target name and namespace
    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// Replace the object identified by `obj`'s metadata
    async fn update(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// Delete the object at `key` (background propagation)
    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<(), kube::Error>;

    /// Merge-patch the status sub-resource of the object at `key`
    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, kube::Error>;
}

/// `ObjectStore` backed by a live API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<DynamicObject, kube::Error> {
        trace!(kind = %resource.kind, key = %key, "get");
        self.api(resource, key.namespace.as_deref())
            .get(&key.name)
            .await
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        trace!(kind = %resource.kind, name = ?obj.metadata.name, "create");
        self.api(resource, obj.metadata.namespace.as_deref())
            .create(&post_params(), obj)
            .await
    }

    async fn update(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        trace!(kind = %resource.kind, name = %name, "update");
        self.api(resource, obj.metadata.namespace.as_deref())
            .replace(&name, &post_params(), obj)
            .await
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<(), kube::Error> {
        trace!(kind = %resource.kind, key = %key, "delete");
        self.api(resource, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, kube::Error> {
        trace!(kind = %resource.kind, key = %key, "patch status");
        let patch = serde_json::json!({ "status": status });
        self.api(resource, key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
    }
}
