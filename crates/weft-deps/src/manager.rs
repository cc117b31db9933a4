//! The dependency manager
//!
//! One [`DependencyManager`] is built at process start and shared by `Arc`
//! with every Deps graph and controller. It knows which kinds may appear as
//! the logical owner in a DependencyOf record, stamps cluster-scoped children
//! with that record, and maps a dependent back to its owner so watches on
//! anchors can requeue the right top-level object.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::ObjectRef;
use kube::Resource;
use tracing::debug;

use weft_common::crd::{Tenant, WebhookTrigger, WeftCore, WorkflowRun};
use weft_common::{Result, FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT};
use weft_converge::ownership::{dependency_of, is_dependency_of, label, set_dependency_of};
use weft_converge::{DependencyOf, ManagedKind, Owner};

/// Registry of owner kinds plus the DependencyOf operations graphs share
#[derive(Clone, Debug)]
pub struct DependencyManager {
    field_manager: String,
    owner_kinds: BTreeSet<(String, String)>,
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyManager {
    /// Manager with the four Weft top-level kinds registered
    pub fn new() -> Self {
        let mut manager = Self::empty(FIELD_MANAGER);
        manager.register::<WeftCore>();
        manager.register::<WorkflowRun>();
        manager.register::<WebhookTrigger>();
        manager.register::<Tenant>();
        manager
    }

    /// Manager with no registered kinds
    pub fn empty(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            owner_kinds: BTreeSet::new(),
        }
    }

    /// Allow `K` as a logical owner
    pub fn register<K: ManagedKind>(&mut self) {
        self.owner_kinds
            .insert((K::api_version(&()).into_owned(), K::kind_name()));
    }

    /// Field manager for writes made on behalf of graphs
    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }

    /// Whether `record` names a registered owner kind
    pub fn is_registered(&self, record: &DependencyOf) -> bool {
        self.owner_kinds
            .contains(&(record.api_version.clone(), record.kind.clone()))
    }

    /// Record `owner` as the logical owner of a resource it cannot own
    /// natively (cluster-scoped, or in another namespace)
    pub fn claim(&self, target: &mut ObjectMeta, owner: &Owner) -> Result<()> {
        label(target, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT);
        set_dependency_of(target, owner)?;
        Ok(())
    }

    /// Whether `target` was claimed by `owner`
    pub fn is_claimed_by(&self, target: &ObjectMeta, owner: &Owner) -> Result<bool> {
        is_dependency_of(target, owner)
    }

    /// Logical owner of kind `K` recorded on `dependent`, if any.
    ///
    /// Malformed records and records naming other kinds map to `None`; a
    /// watch mapper has nowhere to report an error.
    pub fn owners_of<K>(&self, dependent: &ObjectMeta) -> Option<ObjectRef<K>>
    where
        K: Resource<DynamicType = ()>,
    {
        let record = match dependency_of(dependent) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed dependency record");
                return None;
            }
        };
        if !self.is_registered(&record)
            || record.kind != K::kind(&())
            || record.api_version != K::api_version(&())
        {
            return None;
        }
        let reference = ObjectRef::new(&record.name);
        Some(match record.namespace {
            Some(ns) => reference.within(&ns),
            None => reference,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_common::ANNOTATION_DEPENDENCY_OF;
    use weft_converge::ownership::annotate;

    fn run_owner() -> Owner {
        Owner {
            api_version: "weft.dev/v1alpha1".to_string(),
            kind: "WorkflowRun".to_string(),
            namespace: Some("tenant-a".to_string()),
            name: "run-42".to_string(),
            uid: "run-uid".to_string(),
        }
    }

    #[test]
    fn owners_of_maps_claimed_dependents_to_their_owner() {
        let manager = DependencyManager::new();
        let mut anchor = ObjectMeta::default();
        manager.claim(&mut anchor, &run_owner()).unwrap();

        let owner: ObjectRef<WorkflowRun> = manager.owners_of(&anchor).unwrap();
        assert_eq!(owner.name, "run-42");
        assert_eq!(owner.namespace.as_deref(), Some("tenant-a"));
        assert!(manager.owners_of::<Tenant>(&anchor).is_none());
    }

    #[test]
    fn unregistered_kinds_are_not_mapped() {
        let manager = DependencyManager::empty("test");
        let mut anchor = ObjectMeta::default();
        manager.claim(&mut anchor, &run_owner()).unwrap();
        assert!(manager.owners_of::<WorkflowRun>(&anchor).is_none());
    }

    #[test]
    fn malformed_records_are_ignored() {
        let manager = DependencyManager::new();
        let mut anchor = ObjectMeta::default();
        annotate(&mut anchor, ANNOTATION_DEPENDENCY_OF, "{not json");
        assert!(manager.owners_of::<WorkflowRun>(&anchor).is_none());
    }

    #[test]
    fn claim_labels_and_records() {
        let manager = DependencyManager::new();
        let mut role = ObjectMeta::default();
        manager.claim(&mut role, &run_owner()).unwrap();
        assert!(manager.is_claimed_by(&role, &run_owner()).unwrap());
        assert_eq!(
            role.labels.unwrap()[LABEL_MANAGED_BY],
            LABEL_MANAGED_BY_WEFT
        );
    }
}
