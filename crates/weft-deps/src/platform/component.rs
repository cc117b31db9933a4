//! A platform component: service account, optional cluster RBAC, Deployment,
//! optional Service, and optional credential-agent sidecar
//!
//! The operator, metadata API, and log service differ only in the container
//! they run, the cluster rules they need, and whether they serve a port.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    Service, ServiceAccount, ServicePort, ServiceSpec, Volume,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info};

use weft_common::crd::{ComponentSpec, VaultSpec};
use weft_common::{Result, LABEL_COMPONENT, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT, LABEL_NAME};
use weft_converge::{
    Handle, Loader, Loaders, ObjectKey, ObjectStore, Ownable, Owner, Persister, Persisters,
};

use super::credential_agent::{AgentConfigRenderer, CredentialAgentDeps};
use crate::access::apply_labels;
use crate::manager::DependencyManager;
use crate::naming;

/// Labels of a component's resources; also its pod selector
pub fn component_labels(name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), name.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_WEFT.to_string()),
    ])
}

/// Shorthand for a policy rule
pub fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Environment variable with a literal value
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// `POD_NAME` / `POD_NAMESPACE` from the downward API
pub fn downward_env() -> Vec<EnvVar> {
    let field = |name: &str, path: &str| EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    vec![
        field("POD_NAME", "metadata.name"),
        field("POD_NAMESPACE", "metadata.namespace"),
    ]
}

/// What distinguishes one component from another
pub struct ComponentTemplate<'a> {
    /// User-facing settings (image, replicas, env, annotations)
    pub spec: &'a ComponentSpec,
    /// Main container; image, pull policy, and user env are filled in
    pub container: Container,
    /// Extra pod volumes
    pub volumes: Vec<Volume>,
    /// Cluster-wide rules, if the component needs a ClusterRole
    pub cluster_rules: Option<Vec<PolicyRule>>,
    /// Port served through a Service, if any
    pub port: Option<i32>,
}

/// One platform component
pub struct ComponentDeps {
    component: &'static str,
    /// Pod identity
    pub service_account: Handle<ServiceAccount>,
    /// Cluster-wide rules (cluster-scoped, claimed rather than owned)
    pub cluster_role: Handle<ClusterRole>,
    /// Binds the ClusterRole to the service account
    pub cluster_role_binding: Handle<ClusterRoleBinding>,
    /// The workload
    pub deployment: Handle<Deployment>,
    /// In-cluster endpoint
    pub service: Handle<Service>,
    /// Credential-agent configuration, when Vault is configured
    pub agent: Option<CredentialAgentDeps>,
    has_cluster_rbac: bool,
    has_service: bool,
}

impl ComponentDeps {
    /// Handles for `component` of the core `core` in `namespace`
    pub fn new(namespace: &str, core: &str, component: &'static str, with_agent: bool) -> Self {
        let name = naming::component(core, component);
        let key = ObjectKey::namespaced(namespace, &name);
        let cluster_key = ObjectKey::cluster(naming::cluster_component(namespace, core, component));
        Self {
            component,
            service_account: Handle::new(key.clone(), ServiceAccount::default()),
            cluster_role: Handle::new(cluster_key.clone(), ClusterRole::default()),
            cluster_role_binding: Handle::new(cluster_key, ClusterRoleBinding::default()),
            deployment: Handle::new(key.clone(), Deployment::default()),
            service: Handle::new(key, Service::default()),
            agent: with_agent.then(|| CredentialAgentDeps::new(namespace, &name)),
            has_cluster_rbac: false,
            has_service: false,
        }
    }

    /// Component name, e.g. `metadata-api`
    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Name shared by the namespaced resources
    pub fn name(&self) -> &str {
        &self.deployment.key().name
    }

    /// In-cluster URL of the Service, if the component serves a port
    pub fn service_url(&self, scheme: &str) -> Option<String> {
        let port = self.service.get().spec.as_ref()?.ports.as_ref()?.first()?.port;
        let namespace = self.service.key().namespace.as_deref()?;
        Some(format!("{scheme}://{}.{namespace}.svc:{port}", self.name()))
    }

    /// Desired state of every child
    pub fn configure(
        &mut self,
        manager: &DependencyManager,
        core: &Owner,
        template: ComponentTemplate<'_>,
        vault: Option<(&AgentConfigRenderer, &VaultSpec)>,
    ) -> Result<()> {
        let labels = component_labels(&self.deployment.key().name, self.component);

        apply_labels(self.service_account.meta_mut(), &labels);

        self.has_cluster_rbac = template.cluster_rules.is_some();
        if let Some(rules) = template.cluster_rules {
            self.configure_cluster_rbac(manager, core, &labels, rules)?;
        }

        let mut containers = vec![self.main_container(template.spec, template.container)];
        let mut volumes = template.volumes;
        if let (Some(agent), Some((renderer, vault))) = (self.agent.as_mut(), vault) {
            agent.configure(renderer, vault, self.component, &labels)?;
            containers[0]
                .env
                .get_or_insert_with(Vec::new)
                .push(CredentialAgentDeps::client_env());
            containers.push(agent.sidecar()?);
            volumes.push(agent.volume());
        }

        self.has_service = template.port.is_some();
        if let Some(port) = template.port {
            containers[0].ports = Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: port,
                ..Default::default()
            }]);
            apply_labels(self.service.meta_mut(), &labels);
            self.service.get_mut().spec = Some(ServiceSpec {
                selector: Some(labels.clone()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }

        apply_labels(self.deployment.meta_mut(), &labels);
        self.deployment.get_mut().spec = Some(DeploymentSpec {
            replicas: Some(template.spec.replicas()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: (!template.spec.pod_annotations.is_empty())
                        .then(|| template.spec.pod_annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(self.service_account.key().name.clone()),
                    containers,
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        });
        Ok(())
    }

    fn main_container(&self, spec: &ComponentSpec, mut container: Container) -> Container {
        if container.name.is_empty() {
            container.name = self.component.to_string();
        }
        container.image = Some(spec.image.clone());
        container.image_pull_policy = spec.image_pull_policy.clone();
        let vars = container.env.get_or_insert_with(Vec::new);
        vars.extend(downward_env());
        vars.extend(spec.env.iter().map(|(k, v)| env(k, v.clone())));
        container
    }

    fn configure_cluster_rbac(
        &mut self,
        manager: &DependencyManager,
        core: &Owner,
        labels: &BTreeMap<String, String>,
        rules: Vec<PolicyRule>,
    ) -> Result<()> {
        self.cluster_role.get_mut().rules = Some(rules);
        apply_labels(self.cluster_role.meta_mut(), labels);
        manager.claim(self.cluster_role.meta_mut(), core)?;

        let sa = self.service_account.key().clone();
        let binding = self.cluster_role_binding.get_mut();
        binding.role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: self.cluster_role.key().name.clone(),
        };
        binding.subjects = Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: sa.name,
            namespace: sa.namespace,
            ..Default::default()
        }]);
        apply_labels(self.cluster_role_binding.meta_mut(), labels);
        manager.claim(self.cluster_role_binding.meta_mut(), core)
    }

    /// Delete the cluster-scoped resources `core` claimed.
    ///
    /// Namespaced children are left to garbage collection through the anchor.
    /// A cluster-scoped resource claimed by anyone else is left untouched.
    pub async fn delete_cluster_scoped(
        &mut self,
        store: &dyn ObjectStore,
        manager: &DependencyManager,
        core: &Owner,
    ) -> Result<()> {
        if self.cluster_role_binding.load(store).await? {
            if manager.is_claimed_by(self.cluster_role_binding.meta(), core)? {
                self.cluster_role_binding.delete(store).await?;
            } else {
                debug!(binding = %self.cluster_role_binding.key(), "Not claimed by this core, leaving");
            }
        }
        if self.cluster_role.load(store).await? {
            if manager.is_claimed_by(self.cluster_role.meta(), core)? {
                self.cluster_role.delete(store).await?;
            } else {
                debug!(role = %self.cluster_role.key(), "Not claimed by this core, leaving");
            }
        }
        info!(component = self.component, "Deleted cluster-scoped resources");
        Ok(())
    }
}

#[async_trait]
impl Loader for ComponentDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        let mut loaders = Loaders::new()
            .required(&mut self.service_account)
            .required(&mut self.deployment)
            .optional(&mut self.cluster_role)
            .optional(&mut self.cluster_role_binding)
            .optional(&mut self.service);
        if let Some(agent) = self.agent.as_mut() {
            loaders = loaders.required(agent);
        }
        loaders.load(store).await
    }
}

#[async_trait]
impl Persister for ComponentDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        let has_cluster_rbac = self.has_cluster_rbac;
        let has_service = self.has_service;
        Persisters::new()
            .add(&mut self.service_account)
            .add_opt(has_cluster_rbac.then_some(&mut self.cluster_role as &mut dyn Persister))
            .add_opt(
                has_cluster_rbac
                    .then_some(&mut self.cluster_role_binding as &mut dyn Persister),
            )
            .add_opt(self.agent.as_mut().map(|a| a as &mut dyn Persister))
            .add_opt(has_service.then_some(&mut self.service as &mut dyn Persister))
            .add(&mut self.deployment)
            .persist(store)
            .await
    }
}

impl Ownable for ComponentDeps {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.service_account.owned(owner)?;
        self.deployment.owned(owner)?;
        if self.has_service {
            self.service.owned(owner)?;
        }
        if let Some(agent) = self.agent.as_mut() {
            agent.owned(owner)?;
        }
        Ok(())
    }
}
