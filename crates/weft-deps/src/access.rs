//! Metadata-API access for one workload
//!
//! Runs and triggers both get a pair of ConfigMaps the metadata API serves
//! to the workload (the immutable spec and the mutable outputs), a service
//! account whose token the metadata API acts with, and a Role limited to
//! those two ConfigMaps.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use weft_common::Result;
use weft_converge::ownership::label;
use weft_converge::{
    Handle, Loader, Loaders, ObjectKey, ObjectStore, Ownable, Owner, Persister, Persisters,
    ServiceAccountTokenHandle, WaiterConfig,
};
use weft_identity::{TokenInputs, VaultClaims};

use crate::context::DepsContext;
use crate::naming::{self, OwnerKind};

/// Apply every label in `labels` to `meta`
pub(crate) fn apply_labels(meta: &mut ObjectMeta, labels: &BTreeMap<String, String>) {
    for (k, v) in labels {
        label(meta, k, v);
    }
}

/// ConfigMaps, delegated identity, and RBAC for one workload
pub struct WorkloadAccess {
    /// Spec of the workload, written once
    pub immutable: Handle<ConfigMap>,
    /// Outputs and conditions, written by the metadata API
    pub mutable: Handle<ConfigMap>,
    /// Identity the metadata API acts with
    pub metadata_api: ServiceAccountTokenHandle,
    /// Access to the two ConfigMaps
    pub role: Handle<Role>,
    /// Binds [`Self::role`] to [`Self::metadata_api`]
    pub role_binding: Handle<RoleBinding>,
}

impl WorkloadAccess {
    /// Handles for the workload `owner` of `kind` in `namespace`
    pub fn new(namespace: &str, kind: OwnerKind, owner: &str, waiter: WaiterConfig) -> Self {
        let key = |name: String| ObjectKey::namespaced(namespace, name);
        Self {
            immutable: Handle::new(key(naming::immutable_config_map(kind, owner)), ConfigMap::default())
                .create_only(),
            mutable: Handle::new(key(naming::mutable_config_map(kind, owner)), ConfigMap::default())
                .create_only(),
            metadata_api: ServiceAccountTokenHandle::new(
                key(naming::metadata_api_service_account(kind, owner)),
                waiter,
            ),
            role: Handle::new(key(naming::metadata_api_role(kind, owner)), Role::default()),
            role_binding: Handle::new(key(naming::metadata_api_role(kind, owner)), RoleBinding::default()),
        }
    }

    /// Desired state: `spec` goes into the immutable ConfigMap
    pub fn configure(&mut self, labels: &BTreeMap<String, String>, spec: BTreeMap<String, String>) {
        let immutable = self.immutable.get_mut();
        immutable.data = Some(spec);
        immutable.immutable = Some(true);

        let mutable = self.mutable.get_mut();
        if mutable.data.is_none() {
            mutable.data = Some(BTreeMap::new());
        }

        let config_maps = vec![
            self.immutable.key().name.clone(),
            self.mutable.key().name.clone(),
        ];
        self.role.get_mut().rules = Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["configmaps".to_string()]),
            resource_names: Some(config_maps),
            verbs: ["get", "list", "watch", "update"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..Default::default()
        }]);

        let sa = self.metadata_api.key().clone();
        let binding = self.role_binding.get_mut();
        binding.role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: self.role.key().name.clone(),
        };
        binding.subjects = Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: sa.name,
            namespace: sa.namespace,
            ..Default::default()
        }]);

        apply_labels(self.immutable.meta_mut(), labels);
        apply_labels(self.mutable.meta_mut(), labels);
        apply_labels(self.role.meta_mut(), labels);
        apply_labels(self.role_binding.meta_mut(), labels);
        for (k, v) in labels {
            self.metadata_api.label(k, v);
        }
    }

    /// Token inputs once the delegated token is resolved
    pub fn token_inputs(
        &self,
        ctx: &DepsContext,
        namespace_uid: &str,
        service_account_token: String,
    ) -> TokenInputs {
        let namespace = self.immutable.key().namespace.clone().unwrap_or_default();
        TokenInputs {
            issuer: ctx.issuer_name.clone(),
            audience: ctx.audience.clone(),
            namespace_uid: namespace_uid.to_string(),
            service_account_token,
            immutable_config_map: self.immutable.key().name.clone(),
            mutable_config_map: self.mutable.key().name.clone(),
            vault: VaultClaims {
                engine_path: ctx.vault_engine.clone(),
                secret_path: format!("{namespace}/secrets"),
                connection_path: format!("{namespace}/connections"),
            },
            namespace_name: namespace,
            domain_id: None,
            tenant_id: None,
            ttl: Some(ctx.run_token_ttl),
        }
    }
}

#[async_trait]
impl Loader for WorkloadAccess {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        Loaders::new()
            .required(&mut self.immutable)
            .required(&mut self.mutable)
            .required(&mut self.metadata_api)
            .required(&mut self.role)
            .required(&mut self.role_binding)
            .load(store)
            .await
    }
}

#[async_trait]
impl Persister for WorkloadAccess {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        Persisters::new()
            .add(&mut self.role)
            .add(&mut self.role_binding)
            .add(&mut self.metadata_api)
            .add(&mut self.immutable)
            .add(&mut self.mutable)
            .persist(store)
            .await
    }
}

impl Ownable for WorkloadAccess {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.immutable.owned(owner)?;
        self.mutable.owned(owner)?;
        self.metadata_api.owned(owner)?;
        self.role.owned(owner)?;
        self.role_binding.owned(owner)
    }
}
