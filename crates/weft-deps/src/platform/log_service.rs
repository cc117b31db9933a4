//! Log service component

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;

use weft_common::crd::{LogServiceSpec, WeftCore};
use weft_common::Result;
use weft_converge::{Loader, ObjectStore, Ownable, Owner, Persister};

use super::component::{env, ComponentDeps, ComponentTemplate};
use super::credential_agent::AgentConfigRenderer;
use crate::manager::DependencyManager;

/// Component name
pub const COMPONENT: &str = "log-service";

/// The log service
pub struct LogServiceDeps {
    /// Service account, Deployment, Service, agent
    pub component: ComponentDeps,
}

impl LogServiceDeps {
    /// Handles for the log service of `core` in `namespace`
    pub fn new(namespace: &str, core: &str, with_agent: bool) -> Self {
        Self {
            component: ComponentDeps::new(namespace, core, COMPONENT, with_agent),
        }
    }

    /// Desired state from `spec`
    pub fn configure(
        &mut self,
        manager: &DependencyManager,
        core: &WeftCore,
        owner: &Owner,
        spec: &LogServiceSpec,
        renderer: &AgentConfigRenderer,
    ) -> Result<()> {
        let container = Container {
            name: COMPONENT.to_string(),
            env: Some(vec![env("WEFT_LOG_SERVICE_PORT", spec.port().to_string())]),
            ..Default::default()
        };
        self.component.configure(
            manager,
            owner,
            ComponentTemplate {
                spec: &spec.component,
                container,
                volumes: vec![],
                cluster_rules: None,
                port: Some(spec.port()),
            },
            core.spec.vault.as_ref().map(|vault| (renderer, vault)),
        )
    }
}

#[async_trait]
impl Loader for LogServiceDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.component.load(store).await
    }
}

#[async_trait]
impl Persister for LogServiceDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.component.persist(store).await
    }
}

impl Ownable for LogServiceDeps {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.component.owned(owner)
    }
}
