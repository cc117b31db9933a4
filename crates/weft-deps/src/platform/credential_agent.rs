//! Credential-agent sidecar
//!
//! Each platform component that talks to Vault runs an agent sidecar that
//! logs in with the pod's service account and serves a cached token on
//! loopback. The agent configuration is rendered with minijinja into a
//! ConfigMap mounted by the sidecar.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, Volume, VolumeMount,
};
use minijinja::{context, Environment, UndefinedBehavior};

use weft_common::crd::VaultSpec;
use weft_common::{Error, Result};
use weft_converge::{Handle, Loader, ObjectKey, ObjectStore, Ownable, Owner, Persister};

use crate::access::apply_labels;
use crate::naming;

/// Loopback address the agent listens on
pub const AGENT_LISTEN_ADDRESS: &str = "127.0.0.1:8200";
/// ConfigMap key holding the rendered configuration
pub const AGENT_CONFIG_KEY: &str = "agent.hcl";
/// Mount path of the configuration inside the sidecar
pub const AGENT_CONFIG_DIR: &str = "/etc/weft/credential-agent";
/// Sidecar container name
pub const AGENT_CONTAINER_NAME: &str = "credential-agent";

const AGENT_TEMPLATE: &str = r#"exit_after_auth = false
pid_file = "/tmp/credential-agent.pid"

vault {
  address = "{{ address }}"
}

auto_auth {
  method "kubernetes" {
    mount_path = "auth/{{ auth_mount_path }}"
    config = {
      role = "{{ role }}"
    }
  }

  sink "file" {
    config = {
      path = "/tmp/vault-token"
    }
  }
}

cache {
  use_auto_auth_token = true
}

listener "tcp" {
  address     = "{{ listen_address }}"
  tls_disable = true
}
"#;

/// Renders agent configurations
pub struct AgentConfigRenderer {
    env: Environment<'static>,
}

impl AgentConfigRenderer {
    /// Renderer with the built-in template
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template("agent.hcl", AGENT_TEMPLATE)
            .map_err(|e| Error::internal_with_context("credential_agent", e.to_string()))?;
        Ok(Self { env })
    }

    /// Render the configuration for `role` against `vault`
    pub fn render(&self, vault: &VaultSpec, role: &str) -> Result<String> {
        let template = self
            .env
            .get_template("agent.hcl")
            .map_err(|e| Error::internal_with_context("credential_agent", e.to_string()))?;
        template
            .render(context! {
                address => &vault.address,
                auth_mount_path => vault.auth_mount_path(),
                role => role,
                listen_address => AGENT_LISTEN_ADDRESS,
            })
            .map_err(|e| Error::internal_with_context("credential_agent", e.to_string()))
    }
}

/// Agent configuration of one consumer
pub struct CredentialAgentDeps {
    /// Rendered configuration
    pub config: Handle<ConfigMap>,
    consumer: String,
    image: Option<String>,
}

impl CredentialAgentDeps {
    /// Agent for the component `consumer` in `namespace`
    pub fn new(namespace: &str, consumer: &str) -> Self {
        Self {
            config: Handle::new(
                ObjectKey::namespaced(namespace, naming::credential_agent_config(consumer)),
                ConfigMap::default(),
            ),
            consumer: consumer.to_string(),
            image: None,
        }
    }

    /// Vault role the consumer logs in as
    pub fn role(&self, vault: &VaultSpec, component: &str) -> String {
        format!("{}-{}", vault.role_prefix(), component)
    }

    /// Render the configuration for `component`
    pub fn configure(
        &mut self,
        renderer: &AgentConfigRenderer,
        vault: &VaultSpec,
        component: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let rendered = renderer.render(vault, &self.role(vault, component))?;
        apply_labels(self.config.meta_mut(), labels);
        self.config.get_mut().data =
            Some(BTreeMap::from([(AGENT_CONFIG_KEY.to_string(), rendered)]));
        self.image = Some(vault.agent_image.clone());
        Ok(())
    }

    fn volume_name(&self) -> String {
        format!("{}-config", AGENT_CONTAINER_NAME)
    }

    /// Volume holding the configuration
    pub fn volume(&self) -> Volume {
        Volume {
            name: self.volume_name(),
            config_map: Some(ConfigMapVolumeSource {
                name: self.config.key().name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The sidecar container; [`Self::configure`] must have run
    pub fn sidecar(&self) -> Result<Container> {
        let image = self.image.clone().ok_or_else(|| {
            Error::internal_with_context(
                "credential_agent",
                format!("sidecar for {} requested before configure", self.consumer),
            )
        })?;
        Ok(Container {
            name: AGENT_CONTAINER_NAME.to_string(),
            image: Some(image),
            args: Some(vec![
                "agent".to_string(),
                format!("-config={AGENT_CONFIG_DIR}/{AGENT_CONFIG_KEY}"),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: self.volume_name(),
                mount_path: AGENT_CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        })
    }

    /// Environment pointing the main container at the agent
    pub fn client_env() -> EnvVar {
        EnvVar {
            name: "VAULT_ADDR".to_string(),
            value: Some(format!("http://{AGENT_LISTEN_ADDRESS}")),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Loader for CredentialAgentDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.config.load(store).await
    }
}

#[async_trait]
impl Persister for CredentialAgentDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.config.persist(store).await
    }
}

impl Ownable for CredentialAgentDeps {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.config.owned(owner)
    }
}
