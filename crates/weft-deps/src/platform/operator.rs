//! Operator component
//!
//! Runs the Weft controllers. Mounts the webhook serving certificate and the
//! signing key, and holds cluster-wide rights over every kind it converges.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, SecretVolumeSource, Volume, VolumeMount};
use k8s_openapi::api::rbac::v1::PolicyRule;

use weft_common::crd::WeftCore;
use weft_common::{Result, WEFT_API_GROUP};
use weft_converge::{Loader, Loaders, ObjectStore, Ownable, Owner, Persister, Persisters};

use super::certificate::CertificateDeps;
use super::component::{component_labels, env, rule, ComponentDeps, ComponentTemplate};
use super::credential_agent::AgentConfigRenderer;
use crate::manager::DependencyManager;

/// Component name
pub const COMPONENT: &str = "operator";
/// Mount path of the webhook certificate
pub const WEBHOOK_TLS_DIR: &str = "/etc/weft/webhook-tls";
/// Mount path of the signing key
pub const SIGNING_KEY_DIR: &str = "/etc/weft/signing-key";

/// Everything the operator points at that other sub-graphs produce
pub struct OperatorInputs<'a> {
    /// Name of the signing-key Secret
    pub signing_key_secret: &'a str,
    /// URL workloads reach the metadata API on
    pub metadata_api_url: &'a str,
}

fn cluster_rules() -> Vec<PolicyRule> {
    let all = ["*"];
    vec![
        rule(WEFT_API_GROUP, &["*"], &all),
        rule(
            "",
            &[
                "namespaces",
                "configmaps",
                "secrets",
                "serviceaccounts",
                "services",
                "limitranges",
                "events",
            ],
            &all,
        ),
        rule(
            "rbac.authorization.k8s.io",
            &["roles", "rolebindings", "clusterroles", "clusterrolebindings"],
            &["get", "list", "watch", "create", "update", "delete", "bind", "escalate"],
        ),
        rule("apps", &["deployments", "statefulsets"], &all),
        rule("batch", &["jobs"], &all),
        rule("networking.k8s.io", &["networkpolicies"], &all),
        rule("events.k8s.io", &["events"], &["create", "patch"]),
        rule("coordination.k8s.io", &["leases"], &["get", "create", "update"]),
        rule("apiextensions.k8s.io", &["customresourcedefinitions"], &["get", "list", "create", "update"]),
    ]
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// The operator and its webhook certificate
pub struct OperatorDeps {
    /// Service account, RBAC, Deployment, webhook Service, agent
    pub component: ComponentDeps,
    /// Webhook serving certificate
    pub certificate: CertificateDeps,
}

impl OperatorDeps {
    /// Handles for the operator of `core` in `namespace`
    pub fn new(namespace: &str, core: &str, with_agent: bool) -> Self {
        let component = ComponentDeps::new(namespace, core, COMPONENT, with_agent);
        let certificate = CertificateDeps::new(namespace, core, component.name());
        Self {
            component,
            certificate,
        }
    }

    /// Desired state; `now` is Unix seconds, used for certificate rotation
    pub fn configure(
        &mut self,
        manager: &DependencyManager,
        core: &WeftCore,
        owner: &Owner,
        inputs: &OperatorInputs<'_>,
        renderer: &AgentConfigRenderer,
        now: i64,
    ) -> Result<()> {
        let spec = &core.spec.operator;
        let labels = component_labels(self.component.name(), COMPONENT);
        self.certificate.configure(&labels, now)?;

        let namespace = owner.namespace.clone().unwrap_or_default();
        let mut vars = vec![
            env("WEFT_SYSTEM_NAMESPACE", namespace),
            env("WEFT_SIGNING_KEY_SECRET", inputs.signing_key_secret),
            env("WEFT_METADATA_API_URL", inputs.metadata_api_url),
            env("WEFT_WEBHOOK_PORT", spec.webhook_port().to_string()),
            env("WEFT_WEBHOOK_TLS_DIR", WEBHOOK_TLS_DIR),
        ];
        if let Some(concurrency) = spec.concurrency {
            vars.push(env("WEFT_CONCURRENCY", concurrency.to_string()));
        }
        if let Some(level) = &spec.log_level {
            vars.push(env("RUST_LOG", level.clone()));
        }

        let container = Container {
            name: COMPONENT.to_string(),
            env: Some(vars),
            volume_mounts: Some(vec![
                mount("webhook-tls", WEBHOOK_TLS_DIR),
                mount("signing-key", SIGNING_KEY_DIR),
            ]),
            ..Default::default()
        };
        let volumes = vec![
            secret_volume("webhook-tls", &self.certificate.secret.key().name),
            secret_volume("signing-key", inputs.signing_key_secret),
        ];

        self.component.configure(
            manager,
            owner,
            ComponentTemplate {
                spec: &spec.component,
                container,
                volumes,
                cluster_rules: Some(cluster_rules()),
                port: Some(spec.webhook_port()),
            },
            core.spec.vault.as_ref().map(|vault| (renderer, vault)),
        )
    }

    /// Service account name the operator runs as
    pub fn service_account(&self) -> &str {
        &self.component.service_account.key().name
    }
}

#[async_trait]
impl Loader for OperatorDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        Loaders::new()
            .required(&mut self.certificate)
            .required(&mut self.component)
            .load(store)
            .await
    }
}

#[async_trait]
impl Persister for OperatorDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        Persisters::new()
            .add(&mut self.certificate)
            .add(&mut self.component)
            .persist(store)
            .await
    }
}

impl Ownable for OperatorDeps {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.certificate.owned(owner)?;
        self.component.owned(owner)
    }
}
