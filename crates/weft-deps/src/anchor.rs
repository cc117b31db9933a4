//! The dependency anchor
//!
//! Kubernetes refuses controller references across namespaces, but a Tenant
//! owns a namespace other than its own, and a WeftCore owns cluster-scoped
//! RBAC. Each graph therefore persists a small ConfigMap in its working
//! namespace: the anchor. The anchor carries a DependencyOf record naming the
//! true owner and is the native controller of every namespaced child, so
//! garbage collection still cascades locally once the anchor is deleted.
//!
//! The anchor is always persisted before any child, so a crash mid-persist
//! never leaves a child whose owner does not exist yet.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;

use weft_common::{Result, LABEL_ANCHOR, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT};
use weft_converge::ownership::{label, own};
use weft_converge::{Handle, Loader, ObjectKey, ObjectStore, Ownable, Owner, Persister};

use crate::manager::DependencyManager;

/// Anchor ConfigMap of one Deps graph
pub struct DependencyAnchor {
    handle: Handle<ConfigMap>,
}

impl DependencyAnchor {
    /// Anchor at `key`
    pub fn new(key: ObjectKey) -> Self {
        Self {
            handle: Handle::new(key, ConfigMap::default()),
        }
    }

    /// Address of the anchor
    pub fn key(&self) -> &ObjectKey {
        self.handle.key()
    }

    /// The anchor object
    pub fn get(&self) -> &ConfigMap {
        self.handle.get()
    }

    /// Whether the last load found the anchor
    pub fn found(&self) -> bool {
        self.handle.found()
    }

    /// Point the anchor at its logical owner.
    ///
    /// When the owner shares the anchor's namespace it also becomes the
    /// anchor's controller, so deleting the owner cascades through the anchor.
    pub fn depend_on(&mut self, manager: &DependencyManager, owner: &Owner) -> Result<()> {
        let meta = self.handle.meta_mut();
        label(meta, LABEL_ANCHOR, "true");
        label(meta, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT);
        manager.claim(meta, owner)?;
        if meta.namespace == owner.namespace {
            own(meta, owner)?;
        }
        Ok(())
    }

    /// The anchor as an owner; it must have been persisted
    pub fn owner(&self) -> Result<Owner> {
        self.handle.owner()
    }

    /// Make the anchor the controller of `child`
    pub fn own_child(&self, child: &mut dyn Ownable) -> Result<()> {
        child.owned(&self.owner()?)
    }

    /// Delete the anchor; its namespaced children follow by garbage collection
    pub async fn delete(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.handle.delete(store).await
    }
}

#[async_trait]
impl Loader for DependencyAnchor {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.handle.load(store).await
    }
}

#[async_trait]
impl Persister for DependencyAnchor {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.handle.persist(store).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_common::crd::{Tenant, TenantSpec};
    use weft_converge::memory::MemoryStore;
    use weft_converge::ownership::is_dependency_of;

    fn tenant(store: &MemoryStore) -> Tenant {
        let mut tenant = Tenant::new("acme", TenantSpec::default());
        tenant.metadata.namespace = Some("customers".to_string());
        store.insert(&tenant)
    }

    #[tokio::test]
    async fn cross_namespace_owner_is_recorded_not_referenced() {
        let store = MemoryStore::new();
        let owner = Owner::of(&tenant(&store)).unwrap();
        let mut anchor = DependencyAnchor::new(ObjectKey::namespaced("customers-acme", "acme-anchor"));

        anchor.depend_on(&DependencyManager::new(), &owner).unwrap();
        anchor.persist(&store).await.unwrap();

        let stored: ConfigMap = store.get_typed(anchor.key()).unwrap();
        assert!(is_dependency_of(&stored.metadata, &owner).unwrap());
        assert!(stored.metadata.owner_references.is_none());
        assert_eq!(stored.metadata.labels.unwrap()[LABEL_ANCHOR], "true");
    }

    #[tokio::test]
    async fn same_namespace_owner_also_controls_the_anchor() {
        let store = MemoryStore::new();
        let owner = Owner::of(&tenant(&store)).unwrap();
        let mut anchor = DependencyAnchor::new(ObjectKey::namespaced("customers", "acme-anchor"));

        anchor.depend_on(&DependencyManager::new(), &owner).unwrap();
        anchor.persist(&store).await.unwrap();

        let refs = anchor.get().metadata.owner_references.clone().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, owner.uid);
    }

    #[tokio::test]
    async fn children_need_a_persisted_anchor() {
        let store = MemoryStore::new();
        let mut anchor = DependencyAnchor::new(ObjectKey::namespaced("ns", "x-anchor"));
        let mut child = Handle::new(ObjectKey::namespaced("ns", "x-immutable"), ConfigMap::default());

        assert!(anchor.own_child(&mut child).is_err());
        anchor.persist(&store).await.unwrap();
        anchor.own_child(&mut child).unwrap();
        assert_eq!(
            child.meta().owner_references.as_ref().unwrap()[0].name,
            "x-anchor"
        );
    }
}
