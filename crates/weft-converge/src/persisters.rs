//! Composite persisters
//!
//! Entries are written in the order they were added and the first failure
//! stops the sequence. Nothing is rolled back: every persist is idempotent,
//! so the next reconcile picks up where this one stopped. Graphs add their
//! anchor first so no child is ever written before its owner exists.

use weft_common::Result;

use crate::handle::Persister;
use crate::store::ObjectStore;

/// An ordered, fail-fast set of persisters
#[derive(Default)]
pub struct Persisters<'a> {
    entries: Vec<&'a mut dyn Persister>,
}

impl<'a> Persisters<'a> {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn add(mut self, persister: &'a mut dyn Persister) -> Self {
        self.entries.push(persister);
        self
    }

    /// Append an entry if present
    pub fn add_opt(self, persister: Option<&'a mut dyn Persister>) -> Self {
        match persister {
            Some(p) => self.add(p),
            None => self,
        }
    }

    /// Persist every entry in order, stopping at the first error
    pub async fn persist(self, store: &dyn ObjectStore) -> Result<()> {
        for persister in self.entries {
            persister.persist(store).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};

    use crate::handle::Handle;
    use crate::key::ObjectKey;
    use crate::memory::{MemoryStore, Verb};

    #[tokio::test]
    async fn persists_in_declared_order() {
        let store = MemoryStore::new();
        let mut anchor = Handle::new(ObjectKey::namespaced("ns", "run-anchor"), ConfigMap::default());
        let mut sa = Handle::new(ObjectKey::namespaced("ns", "run-steps"), ServiceAccount::default());
        let mut cm = Handle::new(ObjectKey::namespaced("ns", "run-immutable"), ConfigMap::default());

        Persisters::new()
            .add(&mut anchor)
            .add(&mut sa)
            .add(&mut cm)
            .persist(&store)
            .await
            .unwrap();

        let names: Vec<_> = store.ops().into_iter().map(|op| op.key.name).collect();
        assert_eq!(names, vec!["run-anchor", "run-steps", "run-immutable"]);
    }

    #[tokio::test]
    async fn stops_at_first_failure_without_rollback() {
        let store = MemoryStore::new();
        store.fail_next(Verb::Create, "ServiceAccount", "run-steps", 500);

        let mut anchor = Handle::new(ObjectKey::namespaced("ns", "run-anchor"), ConfigMap::default());
        let mut sa = Handle::new(ObjectKey::namespaced("ns", "run-steps"), ServiceAccount::default());
        let mut cm = Handle::new(ObjectKey::namespaced("ns", "run-immutable"), ConfigMap::default());

        let result = Persisters::new()
            .add(&mut anchor)
            .add(&mut sa)
            .add(&mut cm)
            .persist(&store)
            .await;

        assert!(result.is_err());
        assert!(store.contains::<ConfigMap>(&ObjectKey::namespaced("ns", "run-anchor")));
        assert!(!store.contains::<ConfigMap>(&ObjectKey::namespaced("ns", "run-immutable")));
    }
}
