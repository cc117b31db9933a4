//! Platform core graph
//!
//! A [`WeftCore`] installs the control plane into its own namespace: the
//! operator, the metadata API, the optional log service, a credential-agent
//! sidecar for each when Vault is configured, the operator's webhook serving
//! certificate, and the signing key every workload token is issued with.
//!
//! Namespaced children are controlled by the core's anchor; the cluster-scoped
//! RBAC of each component is claimed through a DependencyOf record on the
//! core and removed by [`CoreDeps::delete`].

pub mod certificate;
pub mod component;
pub mod credential_agent;
pub mod log_service;
pub mod metadata_api;
pub mod operator;
pub mod signing_key;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::info;

use weft_common::crd::{set_condition, Condition, WeftCore, WeftCoreStatus};
use weft_common::{Error, Result};
use weft_converge::{Loader, Loaders, ObjectKey, ObjectStore, Owner, Persister, Persisters};

use crate::anchor::DependencyAnchor;
use crate::context::DepsContext;
use crate::manager::DependencyManager;
use crate::naming::{self, OwnerKind};

use self::component::component_labels;
use self::credential_agent::AgentConfigRenderer;
use self::log_service::LogServiceDeps;
use self::metadata_api::MetadataApiDeps;
use self::operator::{OperatorDeps, OperatorInputs};
use self::signing_key::SigningKeyDeps;

/// Every child of one [`WeftCore`]
pub struct CoreDeps {
    anchor: DependencyAnchor,
    /// Workload signing key
    pub signing_key: SigningKeyDeps,
    /// The operator and its webhook certificate
    pub operator: OperatorDeps,
    /// The metadata API
    pub metadata_api: MetadataApiDeps,
    /// The log service, when enabled
    pub log_service: Option<LogServiceDeps>,
    manager: Arc<DependencyManager>,
    renderer: AgentConfigRenderer,
    audience: String,
    metadata_api_url: Option<String>,
}

/// Namespace of `core`, defaulting to the configured system namespace
fn core_namespace(ctx: &DepsContext, core: &WeftCore) -> String {
    core.namespace()
        .unwrap_or_else(|| ctx.system_namespace.clone())
}

/// Key of the signing-key Secret of `core`
pub fn signing_key_key(ctx: &DepsContext, core: &WeftCore) -> ObjectKey {
    let name = core
        .spec
        .signing_key_secret_name
        .clone()
        .unwrap_or_else(|| naming::signing_key_secret(&core.name_any()));
    ObjectKey::namespaced(core_namespace(ctx, core), name)
}

impl CoreDeps {
    /// Handles for every child of `core`
    pub fn new(ctx: &DepsContext, core: &WeftCore) -> Result<Self> {
        let name = core.name_any();
        let namespace = core_namespace(ctx, core);
        let with_agent = core.spec.vault.is_some();
        Ok(Self {
            anchor: DependencyAnchor::new(ObjectKey::namespaced(
                &namespace,
                naming::anchor(OwnerKind::Core, &name),
            )),
            signing_key: SigningKeyDeps::new(signing_key_key(ctx, core)),
            operator: OperatorDeps::new(&namespace, &name, with_agent),
            metadata_api: MetadataApiDeps::new(&namespace, &name, with_agent),
            log_service: core
                .spec
                .log_service
                .as_ref()
                .map(|_| LogServiceDeps::new(&namespace, &name, with_agent)),
            manager: ctx.manager.clone(),
            renderer: AgentConfigRenderer::new()?,
            audience: ctx.audience.clone(),
            metadata_api_url: None,
        })
    }

    /// Desired state of every child. `now` drives certificate rotation.
    pub fn configure(&mut self, core: &WeftCore, now: DateTime<Utc>) -> Result<()> {
        let owner = Owner::of(core)?;
        self.anchor.depend_on(&self.manager, &owner)?;

        let labels = component_labels(&core.name_any(), "signing-key");
        self.signing_key.configure(&labels)?;
        let public_key = self.signing_key.public_key().ok_or_else(|| {
            Error::internal_with_context("core", "signing key has no public half after configure")
        })?;

        self.metadata_api
            .configure(
            &self.manager,
            core,
            &owner,
            &public_key,
            &self.audience,
            &self.renderer,
        )?;
        if let (Some(log_service), Some(spec)) =
            (self.log_service.as_mut(), core.spec.log_service.as_ref())
        {
            log_service.configure(&self.manager, core, &owner, spec, &self.renderer)?;
        }

        let url = self.metadata_api.url(core).ok_or_else(|| {
            Error::internal_with_context("core", "metadata API has neither a URL nor a Service")
        })?;
        let signing_key_secret = self.signing_key.secret.key().name.clone();
        self.operator.configure(
            &self.manager,
            core,
            &owner,
            &OperatorInputs {
                signing_key_secret: &signing_key_secret,
                metadata_api_url: &url,
            },
            &self.renderer,
            now.timestamp(),
        )?;
        self.metadata_api_url = Some(url);
        Ok(())
    }

    /// Status after a successful apply
    pub fn status(&self, core: &WeftCore) -> WeftCoreStatus {
        let mut conditions = core
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        set_condition(
            &mut conditions,
            Condition::ready("DependenciesApplied", "All platform components applied"),
        );
        WeftCoreStatus {
            observed_generation: core.metadata.generation,
            conditions,
            operator_service_account: Some(self.operator.service_account().to_string()),
            metadata_api_url: self.metadata_api_url.clone(),
        }
    }

    /// Remove what garbage collection cannot: the claimed cluster-scoped RBAC,
    /// then the anchor, which takes every namespaced child with it
    pub async fn delete(&mut self, store: &dyn ObjectStore, core: &WeftCore) -> Result<()> {
        let owner = Owner::of(core)?;
        self.operator
            .component
            .delete_cluster_scoped(store, &self.manager, &owner)
            .await?;
        self.metadata_api
            .component
            .delete_cluster_scoped(store, &self.manager, &owner)
            .await?;
        if let Some(log_service) = self.log_service.as_mut() {
            log_service
                .component
                .delete_cluster_scoped(store, &self.manager, &owner)
                .await?;
        }
        self.anchor.delete(store).await?;
        info!(core = %core.name_any(), "Deleted platform core dependencies");
        Ok(())
    }
}

#[async_trait]
impl Loader for CoreDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        let mut loaders = Loaders::new()
            .required(&mut self.anchor)
            .required(&mut self.signing_key)
            .required(&mut self.metadata_api)
            .required(&mut self.operator);
        if let Some(log_service) = self.log_service.as_mut() {
            loaders = loaders.required(log_service);
        }
        loaders.load(store).await
    }
}

#[async_trait]
impl Persister for CoreDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.anchor.persist(store).await?;
        self.anchor.own_child(&mut self.signing_key)?;
        self.anchor.own_child(&mut self.metadata_api)?;
        self.anchor.own_child(&mut self.operator)?;
        if let Some(log_service) = self.log_service.as_mut() {
            self.anchor.own_child(log_service)?;
        }

        Persisters::new()
            .add(&mut self.signing_key)
            .add(&mut self.metadata_api)
            .add_opt(self.log_service.as_mut().map(|l| l as &mut dyn Persister))
            .add(&mut self.operator)
            .persist(store)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use k8s_openapi::api::rbac::v1::ClusterRole;
    use weft_common::crd::{
        ComponentSpec, LogServiceSpec, MetadataApiSpec, OperatorSpec, VaultSpec, WeftCoreSpec,
    };
    use weft_converge::memory::{MemoryStore, Verb};
    use weft_converge::ownership::is_dependency_of;

    fn component(image: &str) -> ComponentSpec {
        ComponentSpec {
            image: image.to_string(),
            ..Default::default()
        }
    }

    fn core(store: &MemoryStore, vault: bool) -> WeftCore {
        let mut core = WeftCore::new(
            "core",
            WeftCoreSpec {
                operator: OperatorSpec {
                    component: component("weft/operator:1"),
                    ..Default::default()
                },
                metadata_api: MetadataApiSpec {
                    component: component("weft/metadata-api:1"),
                    ..Default::default()
                },
                log_service: Some(LogServiceSpec {
                    component: component("weft/log-service:1"),
                    port: None,
                }),
                vault: vault.then(|| VaultSpec {
                    address: "https://vault:8200".to_string(),
                    agent_image: "hashicorp/vault:1.17".to_string(),
                    ..Default::default()
                }),
                signing_key_secret_name: None,
            },
        );
        core.metadata.namespace = Some("weft-system".to_string());
        store.insert(&core)
    }

    fn ctx() -> DepsContext {
        DepsContext::new(Arc::new(DependencyManager::new()))
    }

    async fn apply(store: &MemoryStore, core: &WeftCore) -> CoreDeps {
        let mut deps = CoreDeps::new(&ctx(), core).unwrap();
        deps.load(store).await.unwrap();
        deps.configure(core, Utc::now()).unwrap();
        deps.persist(store).await.unwrap();
        deps
    }

    #[tokio::test]
    async fn first_apply_writes_anchor_before_any_child() {
        let store = MemoryStore::new();
        let core = core(&store, true);
        apply(&store, &core).await;

        let ops = store.ops();
        assert_eq!(ops[0].kind, "ConfigMap");
        assert_eq!(ops[0].key.name, "core-core-anchor");
        assert!(store.contains::<Secret>(&ObjectKey::namespaced("weft-system", "core-signing-key")));
        assert!(store.contains::<Secret>(&ObjectKey::namespaced("weft-system", "core-webhook-tls")));
        assert!(store.contains::<ConfigMap>(&ObjectKey::namespaced(
            "weft-system",
            "core-operator-credential-agent"
        )));
        assert!(store.contains::<Deployment>(&ObjectKey::namespaced("weft-system", "core-log-service")));
    }

    #[tokio::test]
    async fn namespaced_children_are_owned_by_the_anchor() {
        let store = MemoryStore::new();
        let core = core(&store, false);
        apply(&store, &core).await;

        let deployment: Deployment = store
            .get_typed(&ObjectKey::namespaced("weft-system", "core-operator"))
            .unwrap();
        let refs = deployment.metadata.owner_references.unwrap();
        assert_eq!(refs[0].kind, "ConfigMap");
        assert_eq!(refs[0].name, "core-core-anchor");
    }

    #[tokio::test]
    async fn cluster_rbac_is_claimed_not_owned() {
        let store = MemoryStore::new();
        let core = core(&store, false);
        apply(&store, &core).await;

        let role: ClusterRole = store
            .get_typed(&ObjectKey::cluster("weft-weft-system-core-metadata-api"))
            .unwrap();
        assert!(role.metadata.owner_references.is_none());
        assert!(is_dependency_of(&role.metadata, &Owner::of(&core).unwrap()).unwrap());
    }

    #[tokio::test]
    async fn second_apply_changes_nothing() {
        let store = MemoryStore::new();
        let core = core(&store, true);
        apply(&store, &core).await;
        store.clear_ops();

        apply(&store, &core).await;
        assert!(store.changes().is_empty(), "{:?}", store.changes());
    }

    #[tokio::test]
    async fn status_reports_operator_and_metadata_api() {
        let store = MemoryStore::new();
        let core = core(&store, false);
        let deps = apply(&store, &core).await;

        let status = deps.status(&core);
        assert_eq!(status.operator_service_account.as_deref(), Some("core-operator"));
        assert_eq!(
            status.metadata_api_url.as_deref(),
            Some("http://core-metadata-api.weft-system.svc:7000")
        );
        assert_eq!(status.conditions.len(), 1);
    }

    #[tokio::test]
    async fn delete_leaves_rbac_claimed_by_another_core() {
        let store = MemoryStore::new();
        let core = core(&store, false);
        let mut deps = apply(&store, &core).await;

        let key = ObjectKey::cluster("weft-weft-system-core-operator");
        let mut role: ClusterRole = store.get_typed(&key).unwrap();
        role.metadata.annotations = None;
        store.insert(&role);
        store.clear_ops();

        deps.delete(&store, &core).await.unwrap();
        assert!(store.contains::<ClusterRole>(&key));
        assert!(!store.contains::<ClusterRole>(&ObjectKey::cluster(
            "weft-weft-system-core-metadata-api"
        )));
        assert!(store
            .ops()
            .iter()
            .any(|op| op.verb == Verb::Delete && op.key.name == "core-core-anchor"));
    }
}
