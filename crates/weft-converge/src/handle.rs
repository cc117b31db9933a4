//! Resource handles and the Load / Persist / Own capabilities
//!
//! A [`Handle`] pairs an authoritative [`ObjectKey`] with the typed object it
//! addresses. Deps graphs hold one handle per child resource; `Configure`
//! mutates the handle's object in place so server-owned metadata loaded by
//! `Load` (uid, resource version) is preserved for the following update.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use weft_common::Result;

use crate::key::ObjectKey;
use crate::kinds::ManagedKind;
use crate::ops;
use crate::ownership::{self, Owner};
use crate::store::ObjectStore;

/// Something that can be fetched from the cluster
#[async_trait]
pub trait Loader: Send {
    /// Fetch live state. `Ok(false)` means "not found / not ready".
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool>;
}

/// Something that can be written to the cluster
#[async_trait]
pub trait Persister: Send {
    /// Write desired state
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()>;
}

/// Something that accepts a controller reference
pub trait Ownable {
    /// Register `owner` as the controller of this resource (and its children)
    fn owned(&mut self, owner: &Owner) -> Result<()>;
}

/// How a handle is written on persist
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistMode {
    /// Create, then replace on every later persist
    CreateOrUpdate,
    /// Create once; never overwrite afterwards
    CreateOnly,
}

/// A typed object addressed by an authoritative key
#[derive(Clone, Debug)]
pub struct Handle<K: ManagedKind> {
    key: ObjectKey,
    object: K,
    found: bool,
    mode: PersistMode,
}

impl<K: ManagedKind> Handle<K> {
    /// Handle for `object` at `key`; the object's identity is forced to `key`
    pub fn new(key: ObjectKey, mut object: K) -> Self {
        key.apply_to(object.meta_mut());
        Self {
            key,
            object,
            found: false,
            mode: PersistMode::CreateOrUpdate,
        }
    }

    /// Only ever create this object; later persists leave it untouched
    pub fn create_only(mut self) -> Self {
        self.mode = PersistMode::CreateOnly;
        self
    }

    /// The object's address
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Current (loaded or configured) object
    pub fn get(&self) -> &K {
        &self.object
    }

    /// Mutable access for `Configure`
    pub fn get_mut(&mut self) -> &mut K {
        &mut self.object
    }

    /// Metadata of the object
    pub fn meta(&self) -> &ObjectMeta {
        self.object.meta()
    }

    /// Mutable metadata of the object
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        self.object.meta_mut()
    }

    /// Whether the last load found the object
    pub fn found(&self) -> bool {
        self.found
    }

    /// Whether the object exists server-side (it has a uid)
    pub fn exists(&self) -> bool {
        self.object.meta().uid.is_some()
    }

    /// Owner identity of this object; it must have been persisted
    pub fn owner(&self) -> Result<Owner> {
        Owner::of(&self.object)
    }

    /// Delete the object if present
    pub async fn delete(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.key.apply_to(self.object.meta_mut());
        ops::delete_ignore_not_found(store, &self.object).await
    }
}

#[async_trait]
impl<K: ManagedKind> Loader for Handle<K> {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.found = ops::get_ignore_not_found(store, &self.key, &mut self.object).await?;
        Ok(self.found)
    }
}

#[async_trait]
impl<K: ManagedKind> Persister for Handle<K> {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        match self.mode {
            PersistMode::CreateOrUpdate => {
                ops::create_or_update(store, &self.key, &mut self.object).await?
            }
            PersistMode::CreateOnly => {
                ops::create(store, &self.key, &mut self.object).await?;
            }
        }
        self.found = true;
        Ok(())
    }
}

impl<K: ManagedKind> Ownable for Handle<K> {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.key.apply_to(self.object.meta_mut());
        ownership::own(self.object.meta_mut(), owner)?;
        Ok(())
    }
}
