//! The closed set of kinds the control plane manages
//!
//! Handles, primitives, and ownership only accept a [`ManagedKind`]. The set
//! is sealed: adding a kind means adding it to the list at the bottom of this
//! file, so every resource the operator can touch is visible in one place.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, LimitRange, Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use weft_common::crd::{Tenant, WebhookTrigger, WeftCore, WorkflowRun};
use weft_common::{Error, Result};

mod sealed {
    pub trait Sealed {}
}

/// A resource kind the control plane is allowed to converge
pub trait ManagedKind:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static + sealed::Sealed
{
    /// API resource descriptor for the dynamic store
    fn api_resource() -> ApiResource {
        ApiResource::erase::<Self>(&())
    }

    /// Kind name, for logs and error messages
    fn kind_name() -> String {
        Self::kind(&()).into_owned()
    }
}

macro_rules! managed_kinds {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl ManagedKind for $ty {}
        )*
    };
}

managed_kinds!(
    Namespace,
    ConfigMap,
    Secret,
    ServiceAccount,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    Deployment,
    StatefulSet,
    Service,
    NetworkPolicy,
    LimitRange,
    Job,
    WeftCore,
    WorkflowRun,
    WebhookTrigger,
    Tenant,
);

/// Convert a typed object into the store's dynamic representation
pub fn to_dynamic<K: ManagedKind>(obj: &K) -> Result<DynamicObject> {
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind_name(), e.to_string()))?;
    let mut dynamic: DynamicObject = serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind_name(), e.to_string()))?;
    if dynamic.types.is_none() {
        dynamic.types = Some(kube::api::TypeMeta {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind_name(),
        });
    }
    Ok(dynamic)
}

/// Convert a store object back into its typed form
pub fn from_dynamic<K: ManagedKind>(obj: DynamicObject) -> Result<K> {
    let mut value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind_name(), e.to_string()))?;
    // Typed deserializers require apiVersion/kind, which list and watch
    // responses may omit on nested items
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| serde_json::Value::String(K::api_version(&()).into_owned()));
        map.entry("kind")
            .or_insert_with(|| serde_json::Value::String(K::kind_name()));
    }
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind_name(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn config_map_survives_dynamic_conversion() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("run-42-immutable".to_string());
        cm.metadata.namespace = Some("tenant-a".to_string());
        cm.data = Some(BTreeMap::from([("spec".to_string(), "{}".to_string())]));

        let dynamic = to_dynamic(&cm).unwrap();
        assert_eq!(dynamic.types.as_ref().unwrap().kind, "ConfigMap");
        assert_eq!(dynamic.data["data"]["spec"], "{}");

        let back: ConfigMap = from_dynamic(dynamic).unwrap();
        assert_eq!(back, cm);
    }

    #[test]
    fn api_resource_for_cluster_scoped_kind() {
        let ar = ClusterRole::api_resource();
        assert_eq!(ar.group, "rbac.authorization.k8s.io");
        assert_eq!(ar.plural, "clusterroles");
    }

    #[test]
    fn crd_kinds_resolve_to_weft_group() {
        let ar = WorkflowRun::api_resource();
        assert_eq!(ar.group, "weft.dev");
        assert_eq!(ar.kind, "WorkflowRun");
    }

    #[test]
    fn missing_type_meta_is_filled_from_kind() {
        let dynamic = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::json!({"data": {"k": "v"}}),
        };
        let cm: ConfigMap = from_dynamic(dynamic).unwrap();
        assert_eq!(cm.data.unwrap()["k"], "v");
    }
}
