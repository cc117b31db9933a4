//! Native controller references plus the annotation-based DependencyOf record
//!
//! Kubernetes refuses controller references that cross namespaces, and its
//! garbage collector never acts on cluster-scoped dependents of namespaced
//! owners. Where that matters the control plane records the relationship in
//! the `weft.dev/dependency-of` annotation instead; cleanup code reads it back
//! with [`is_dependency_of`] before deleting anything shared.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use serde::{Deserialize, Serialize};
use tracing::warn;

use weft_common::{
    Error, Result, ANNOTATION_DEPENDENCY_OF, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT,
};

/// Identity of a persisted object that can own or be depended on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    /// `group/version` of the owner
    pub api_version: String,
    /// Owner kind
    pub kind: String,
    /// Owner namespace, `None` when cluster-scoped
    pub namespace: Option<String>,
    /// Owner name
    pub name: String,
    /// Server-assigned uid
    pub uid: String,
}

impl Owner {
    /// Owner identity of a loaded object. Fails if it was never persisted.
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<Self> {
        let meta = obj.meta();
        let name = meta.name.clone().unwrap_or_default();
        let uid = meta.uid.clone().ok_or_else(|| {
            Error::internal_with_context(
                "ownership",
                format!("{}/{} has no uid; persist it before owning children", K::kind(&()), name),
            )
        })?;
        Ok(Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace: meta.namespace.clone(),
            name,
            uid,
        })
    }

    /// Controller reference pointing at this owner
    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// Make `owner` the controller of `target`.
///
/// Returns whether `target` changed. If another object currently controls
/// `target`, that reference is demoted (kept, but `controller: false`) and a
/// warning is logged; the most recent caller wins.
pub fn own(target: &mut ObjectMeta, owner: &Owner) -> Result<bool> {
    if target.namespace != owner.namespace {
        return Err(Error::OwnerInOtherNamespace {
            owner: owner.describe(),
            owner_namespace: owner.namespace.clone(),
            target: target.name.clone().unwrap_or_default(),
            target_namespace: target.namespace.clone(),
        });
    }

    let mut changed = label(target, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT);
    let desired = owner.controller_ref();
    let refs = target.owner_references.get_or_insert_with(Vec::new);

    for existing in refs.iter_mut() {
        if existing.uid != desired.uid && existing.controller == Some(true) {
            warn!(
                target = ?target.name,
                previous = %format!("{}/{}", existing.kind, existing.name),
                next = %owner.describe(),
                "Taking over controller reference"
            );
            existing.controller = Some(false);
            changed = true;
        }
    }

    match refs.iter_mut().find(|r| r.uid == desired.uid) {
        Some(existing) if *existing == desired => {}
        Some(existing) => {
            *existing = desired;
            changed = true;
        }
        None => {
            refs.push(desired);
            changed = true;
        }
    }

    Ok(changed)
}

/// The DependencyOf record stored on a dependent object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyOf {
    /// Owner `group/version`
    pub api_version: String,
    /// Owner kind
    pub kind: String,
    /// Owner namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Owner name
    pub name: String,
    /// Owner uid
    pub uid: String,
}

impl From<&Owner> for DependencyOf {
    fn from(owner: &Owner) -> Self {
        Self {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            namespace: owner.namespace.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
        }
    }
}

/// Record `owner` as the logical owner of `target`, replacing any previous record
pub fn set_dependency_of(target: &mut ObjectMeta, owner: &Owner) -> Result<bool> {
    let encoded = serde_json::to_string(&DependencyOf::from(owner))?;
    Ok(annotate(target, ANNOTATION_DEPENDENCY_OF, &encoded))
}

/// Parse the DependencyOf record on `target`, if any
pub fn dependency_of(target: &ObjectMeta) -> Result<Option<DependencyOf>> {
    let Some(raw) = target
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_DEPENDENCY_OF))
    else {
        return Ok(None);
    };
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| Error::MalformedDependencyOf {
            target: target.name.clone().unwrap_or_default(),
            message: e.to_string(),
        })
}

/// Whether `target`'s DependencyOf record names exactly `owner`
pub fn is_dependency_of(target: &ObjectMeta, owner: &Owner) -> Result<bool> {
    Ok(dependency_of(target)?.is_some_and(|record| record == DependencyOf::from(owner)))
}

/// Set one label, returning whether it changed
pub fn label(target: &mut ObjectMeta, key: &str, value: &str) -> bool {
    set_entry(target.labels.get_or_insert_with(Default::default), key, value)
}

/// Set one annotation, returning whether it changed
pub fn annotate(target: &mut ObjectMeta, key: &str, value: &str) -> bool {
    set_entry(
        target.annotations.get_or_insert_with(Default::default),
        key,
        value,
    )
}

/// Merge every label and annotation of `source` into `target`
pub fn copy_labels_and_annotations(target: &mut ObjectMeta, source: &ObjectMeta) -> bool {
    let mut changed = false;
    for (k, v) in source.labels.iter().flatten() {
        changed |= label(target, k, v);
    }
    for (k, v) in source.annotations.iter().flatten() {
        changed |= annotate(target, k, v);
    }
    changed
}

fn set_entry(
    map: &mut std::collections::BTreeMap<String, String>,
    key: &str,
    value: &str,
) -> bool {
    if map.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    map.insert(key.to_string(), value.to_string());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str, uid: &str) -> Owner {
        Owner {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: Some("tenant-a".to_string()),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    fn target() -> ObjectMeta {
        ObjectMeta {
            name: Some("run-42-immutable".to_string()),
            namespace: Some("tenant-a".to_string()),
            ..Default::default()
        }
    }

    /// Story: owning twice yields exactly one controller reference
    #[test]
    fn story_own_is_idempotent() {
        let mut meta = target();
        let anchor = owner("run-42-anchor", "uid-a");

        assert!(own(&mut meta, &anchor).unwrap());
        assert!(!own(&mut meta, &anchor).unwrap());

        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].controller, Some(true));
        assert_eq!(
            meta.labels.unwrap()[LABEL_MANAGED_BY],
            LABEL_MANAGED_BY_WEFT
        );
    }

    /// Story: a second owner steals control, the first is demoted but kept
    #[test]
    fn story_ownership_steal_demotes_previous_controller() {
        let mut meta = target();
        own(&mut meta, &owner("a", "uid-a")).unwrap();
        own(&mut meta, &owner("b", "uid-b")).unwrap();

        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 2);
        let controllers: Vec<_> = refs
            .iter()
            .filter(|r| r.controller == Some(true))
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(controllers, vec!["b"]);
    }

    #[test]
    fn cross_namespace_ownership_is_refused() {
        let mut meta = target();
        meta.namespace = Some("tenant-b".to_string());

        let err = own(&mut meta, &owner("a", "uid-a")).unwrap_err();
        assert!(matches!(err, Error::OwnerInOtherNamespace { .. }));
        assert!(meta.owner_references.is_none());
        assert!(meta.labels.is_none());
    }

    #[test]
    fn namespaced_owner_cannot_own_cluster_scoped_target() {
        let mut meta = ObjectMeta {
            name: Some("weft-operator".to_string()),
            ..Default::default()
        };
        assert!(own(&mut meta, &owner("a", "uid-a")).is_err());
    }

    /// Story: set then check round-trips; changing any identity field breaks the match
    #[test]
    fn story_dependency_round_trip_is_field_exact() {
        let base = owner("tenant-acme", "uid-t");
        let mut meta = target();
        set_dependency_of(&mut meta, &base).unwrap();
        assert!(is_dependency_of(&meta, &base).unwrap());

        let variants = [
            Owner { namespace: Some("other".to_string()), ..base.clone() },
            Owner { namespace: None, ..base.clone() },
            Owner { name: "other".to_string(), ..base.clone() },
            Owner { uid: "uid-other".to_string(), ..base.clone() },
            Owner { kind: "Secret".to_string(), ..base.clone() },
            Owner { api_version: "weft.dev/v1alpha1".to_string(), ..base.clone() },
        ];
        for variant in variants {
            assert!(!is_dependency_of(&meta, &variant).unwrap(), "{variant:?}");
        }
    }

    #[test]
    fn set_dependency_of_overwrites_previous_record() {
        let mut meta = target();
        set_dependency_of(&mut meta, &owner("a", "uid-a")).unwrap();
        set_dependency_of(&mut meta, &owner("b", "uid-b")).unwrap();

        assert!(!is_dependency_of(&meta, &owner("a", "uid-a")).unwrap());
        assert_eq!(dependency_of(&meta).unwrap().unwrap().name, "b");
    }

    #[test]
    fn absent_annotation_is_not_a_dependency() {
        assert!(!is_dependency_of(&target(), &owner("a", "uid-a")).unwrap());
    }

    #[test]
    fn malformed_annotation_is_an_error() {
        let mut meta = target();
        annotate(&mut meta, ANNOTATION_DEPENDENCY_OF, "{not json");
        let err = is_dependency_of(&meta, &owner("a", "uid-a")).unwrap_err();
        assert!(matches!(err, Error::MalformedDependencyOf { .. }));
    }

    #[test]
    fn label_and_annotate_report_changes() {
        let mut meta = target();
        assert!(label(&mut meta, "k", "v"));
        assert!(!label(&mut meta, "k", "v"));
        assert!(label(&mut meta, "k", "w"));
        assert!(annotate(&mut meta, "a", "1"));
        assert!(!annotate(&mut meta, "a", "1"));
    }

    #[test]
    fn copy_labels_and_annotations_merges() {
        let mut source = ObjectMeta::default();
        label(&mut source, "team", "data");
        annotate(&mut source, "note", "x");

        let mut meta = target();
        label(&mut meta, "keep", "me");
        assert!(copy_labels_and_annotations(&mut meta, &source));
        assert!(!copy_labels_and_annotations(&mut meta, &source));

        let labels = meta.labels.unwrap();
        assert_eq!(labels["team"], "data");
        assert_eq!(labels["keep"], "me");
        assert_eq!(meta.annotations.unwrap()["note"], "x");
    }
}
