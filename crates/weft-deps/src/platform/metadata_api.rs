//! Metadata API component
//!
//! Authenticates workload tokens and serves each workload its spec,
//! outputs, and secrets. It verifies tokens with the public half of the
//! signing key and reviews the delegated service-account tokens they embed.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::rbac::v1::PolicyRule;

use weft_common::crd::WeftCore;
use weft_common::{Result, WEFT_API_GROUP};
use weft_converge::{Loader, ObjectStore, Ownable, Owner, Persister};

use super::component::{env, rule, ComponentDeps, ComponentTemplate};
use super::credential_agent::AgentConfigRenderer;
use crate::manager::DependencyManager;
use crate::network::METADATA_API_COMPONENT;

fn cluster_rules() -> Vec<PolicyRule> {
    vec![
        rule("authentication.k8s.io", &["tokenreviews"], &["create"]),
        rule("", &["configmaps"], &["get", "list", "watch", "update"]),
        rule("", &["pods", "namespaces"], &["get", "list", "watch"]),
        rule(
            WEFT_API_GROUP,
            &["workflowruns", "webhooktriggers"],
            &["get", "list", "watch"],
        ),
    ]
}

/// The metadata API
pub struct MetadataApiDeps {
    /// Service account, RBAC, Deployment, Service, agent
    pub component: ComponentDeps,
}

impl MetadataApiDeps {
    /// Handles for the metadata API of `core` in `namespace`
    pub fn new(namespace: &str, core: &str, with_agent: bool) -> Self {
        Self {
            component: ComponentDeps::new(namespace, core, METADATA_API_COMPONENT, with_agent),
        }
    }

    /// Desired state; `public_key` is the base64 signing public key and
    /// `audience` the `aud` claim the API accepts
    pub fn configure(
        &mut self,
        manager: &DependencyManager,
        core: &WeftCore,
        owner: &Owner,
        public_key: &str,
        audience: &str,
        renderer: &AgentConfigRenderer,
    ) -> Result<()> {
        let spec = &core.spec.metadata_api;
        let container = Container {
            name: METADATA_API_COMPONENT.to_string(),
            env: Some(vec![
                env("WEFT_METADATA_API_PORT", spec.port().to_string()),
                env("WEFT_METADATA_API_AUDIENCE", audience),
                env("WEFT_TOKEN_PUBLIC_KEY", public_key),
            ]),
            ..Default::default()
        };
        self.component.configure(
            manager,
            owner,
            ComponentTemplate {
                spec: &spec.component,
                container,
                volumes: vec![],
                cluster_rules: Some(cluster_rules()),
                port: Some(spec.port()),
            },
            core.spec.vault.as_ref().map(|vault| (renderer, vault)),
        )
    }

    /// URL workloads reach the metadata API on: the configured URL, else the
    /// in-cluster Service address
    pub fn url(&self, core: &WeftCore) -> Option<String> {
        core.spec
            .metadata_api
            .url
            .clone()
            .or_else(|| self.component.service_url("http"))
    }
}

#[async_trait]
impl Loader for MetadataApiDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.component.load(store).await
    }
}

#[async_trait]
impl Persister for MetadataApiDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.component.persist(store).await
    }
}

impl Ownable for MetadataApiDeps {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.component.owned(owner)
    }
}
