//! Tenant graph
//!
//! A tenant gets a working namespace with a LimitRange and a default-deny
//! ingress policy. The namespace is claimed by the tenant only if this graph
//! created it; a namespace that already existed is shared and never touched,
//! and deleting the tenant then removes only what the anchor controls.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LimitRange, LimitRangeItem, LimitRangeSpec, Namespace};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info};

use weft_common::crd::{set_condition, Condition, Tenant, TenantStatus};
use weft_common::error::is_already_exists;
use weft_common::{Error, Result, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT, LABEL_TENANT};
use weft_converge::ownership::annotate;
use weft_converge::{Handle, Loader, Loaders, ObjectKey, ObjectStore, Owner, Persister, Persisters};

use crate::access::apply_labels;
use crate::anchor::DependencyAnchor;
use crate::context::DepsContext;
use crate::manager::DependencyManager;
use crate::naming::{self, OwnerKind};
use crate::network;

/// Default CPU request of tenant containers
pub const DEFAULT_CPU_REQUEST: &str = "100m";
/// Default memory request of tenant containers
pub const DEFAULT_MEMORY_REQUEST: &str = "128Mi";

/// What deleting a tenant did with its namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TenantDeletion {
    /// The namespace was claimed by the tenant and has been deleted
    NamespaceDeleted,
    /// The namespace is shared; only the tenant's own resources were removed
    NamespaceRetained,
}

/// Every child of one [`Tenant`]
pub struct TenantDeps {
    manager: Arc<DependencyManager>,
    tenant: String,
    /// The working namespace
    pub namespace: Handle<Namespace>,
    anchor: DependencyAnchor,
    /// Default container requests
    pub limit_range: Handle<LimitRange>,
    /// Default-deny ingress
    pub network_policy: Handle<NetworkPolicy>,
    manage_namespace: bool,
}

impl TenantDeps {
    /// Handles for every child of `tenant`
    pub fn new(ctx: &DepsContext, tenant: &Tenant) -> Self {
        let name = tenant.name_any();
        let namespace = tenant.working_namespace();
        let key = |child: String| ObjectKey::namespaced(&namespace, child);
        Self {
            manager: ctx.manager.clone(),
            namespace: Handle::new(ObjectKey::cluster(&namespace), Namespace::default()),
            anchor: DependencyAnchor::new(key(naming::anchor(OwnerKind::Tenant, &name))),
            limit_range: Handle::new(key(naming::tenant_limit_range(&name)), LimitRange::default()),
            network_policy: Handle::new(
                key(naming::tenant_network_policy(&name)),
                NetworkPolicy::default(),
            ),
            manage_namespace: false,
            tenant: name,
        }
    }

    /// Name of the working namespace
    pub fn namespace_name(&self) -> &str {
        &self.namespace.key().name
    }

    /// Whether the namespace is claimed by this tenant
    pub fn manages_namespace(&self) -> bool {
        self.manage_namespace
    }

    /// Desired state. Decides from the loaded namespace whether it is ours.
    pub fn configure(&mut self, tenant: &Tenant) -> Result<()> {
        let owner = Owner::of(tenant)?;
        let labels = BTreeMap::from([
            (LABEL_TENANT.to_string(), self.tenant.clone()),
            (LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_WEFT.to_string()),
        ]);

        self.manage_namespace = !self.namespace.found()
            || self.manager.is_claimed_by(self.namespace.meta(), &owner)?;
        if self.manage_namespace {
            let template = &tenant.spec.namespace_template;
            let meta = self.namespace.meta_mut();
            apply_labels(meta, &template.labels);
            apply_labels(meta, &labels);
            for (k, v) in &template.annotations {
                annotate(meta, k, v);
            }
            self.manager.claim(meta, &owner)?;
        } else {
            debug!(namespace = %self.namespace.key(), "Namespace is shared, leaving it untouched");
        }

        self.anchor.depend_on(&self.manager, &owner)?;

        apply_labels(self.limit_range.meta_mut(), &labels);
        self.limit_range.get_mut().spec = Some(LimitRangeSpec {
            limits: vec![LimitRangeItem {
                type_: "Container".to_string(),
                default_request: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity(DEFAULT_CPU_REQUEST.to_string())),
                    ("memory".to_string(), Quantity(DEFAULT_MEMORY_REQUEST.to_string())),
                ])),
                ..Default::default()
            }],
        });

        apply_labels(self.network_policy.meta_mut(), &labels);
        self.network_policy.get_mut().spec = Some(network::default_deny_ingress()?);
        Ok(())
    }

    /// Status after a successful apply
    pub fn status(&self, tenant: &Tenant) -> TenantStatus {
        let mut conditions = tenant
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        set_condition(
            &mut conditions,
            Condition::ready("DependenciesApplied", "Tenant namespace applied"),
        );
        TenantStatus {
            observed_generation: tenant.metadata.generation,
            namespace: Some(self.namespace_name().to_string()),
            conditions,
        }
    }

    /// Delete the namespace if the tenant claimed it, else only the anchor
    /// (and with it everything the anchor controls)
    pub async fn delete(&mut self, store: &dyn ObjectStore, tenant: &Tenant) -> Result<TenantDeletion> {
        let owner = Owner::of(tenant)?;
        if self.namespace.load(store).await?
            && self.manager.is_claimed_by(self.namespace.meta(), &owner)?
        {
            self.namespace.delete(store).await?;
            info!(namespace = %self.namespace.key(), tenant = %self.tenant, "Deleted tenant namespace");
            return Ok(TenantDeletion::NamespaceDeleted);
        }
        self.anchor.delete(store).await?;
        info!(
            namespace = %self.namespace.key(),
            tenant = %self.tenant,
            "Namespace not claimed by tenant, retained it"
        );
        Ok(TenantDeletion::NamespaceRetained)
    }
}

#[async_trait]
impl Loader for TenantDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        Loaders::new()
            .required(&mut self.namespace)
            .required(&mut self.anchor)
            .required(&mut self.limit_range)
            .required(&mut self.network_policy)
            .load(store)
            .await
    }
}

#[async_trait]
impl Persister for TenantDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        if self.manage_namespace {
            // Lost a create race: the next load sees the namespace as shared
            self.namespace.persist(store).await.map_err(|e| match e {
                Error::Kube { source } if is_already_exists(&source) => {
                    debug!(namespace = %self.namespace.key(), "Namespace created concurrently");
                    Error::transient(Error::Kube { source })
                }
                other => other,
            })?;
        }
        self.anchor.persist(store).await?;
        self.anchor.own_child(&mut self.limit_range)?;
        self.anchor.own_child(&mut self.network_policy)?;

        Persisters::new()
            .add(&mut self.limit_range)
            .add(&mut self.network_policy)
            .persist(store)
            .await?;
        info!(tenant = %self.tenant, namespace = %self.namespace.key(), "Applied tenant dependencies");
        Ok(())
    }
}
