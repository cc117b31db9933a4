//! WeftCore CRD: the single top-level resource that installs the platform
//!
//! One WeftCore provisions the operator, the metadata API, the log service,
//! the credential-agent sidecar configuration for each of them, the webhook
//! serving certificate, and the signing key used for workload identity.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComponentSpec, Condition, SecretRef};

/// Default metadata API port
pub const DEFAULT_METADATA_API_PORT: i32 = 7000;
/// Default log service port
pub const DEFAULT_LOG_SERVICE_PORT: i32 = 7101;
/// Default operator admission webhook port
pub const DEFAULT_WEBHOOK_PORT: i32 = 8443;

/// WeftCore installs the Weft runtime into its namespace.
///
/// Example:
/// ```yaml
/// apiVersion: weft.dev/v1alpha1
/// kind: WeftCore
/// metadata:
///   name: weft
///   namespace: weft-system
/// spec:
///   operator:
///     image: ghcr.io/weft/operator:v0.1.0
///   metadataApi:
///     image: ghcr.io/weft/metadata-api:v0.1.0
///   vault:
///     address: http://vault.vault.svc:8200
///     agentImage: hashicorp/vault:1.15
///     tokenSecretRef:
///       name: vault-token
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "weft.dev",
    version = "v1alpha1",
    kind = "WeftCore",
    namespaced,
    status = "WeftCoreStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WeftCoreSpec {
    /// Operator deployment settings
    pub operator: OperatorSpec,

    /// Metadata API deployment settings
    pub metadata_api: MetadataApiSpec,

    /// Log service deployment settings (omit to disable the log service)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_service: Option<LogServiceSpec>,

    /// Vault connection used by the credential-agent sidecars
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultSpec>,

    /// Name of the Secret holding the workload identity signing key
    /// (default: `<name>-signing-key`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key_secret_name: Option<String>,
}

/// Operator settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    /// Container settings
    #[serde(flatten)]
    pub component: ComponentSpec,

    /// Admission webhook port (default 8443)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_port: Option<i32>,

    /// Maximum concurrent reconciles per controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u16>,

    /// Log level passed to the operator (e.g. "info", "debug")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl OperatorSpec {
    /// Webhook port with the default applied
    pub fn webhook_port(&self) -> i32 {
        self.webhook_port.unwrap_or(DEFAULT_WEBHOOK_PORT)
    }
}

/// Metadata API settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataApiSpec {
    /// Container settings
    #[serde(flatten)]
    pub component: ComponentSpec,

    /// Listen port (default 7000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Externally reachable URL; defaults to the in-cluster Service URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl MetadataApiSpec {
    /// Port with the default applied
    pub fn port(&self) -> i32 {
        self.port.unwrap_or(DEFAULT_METADATA_API_PORT)
    }
}

/// Log service settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogServiceSpec {
    /// Container settings
    #[serde(flatten)]
    pub component: ComponentSpec,

    /// Listen port (default 7101)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

impl LogServiceSpec {
    /// Port with the default applied
    pub fn port(&self) -> i32 {
        self.port.unwrap_or(DEFAULT_LOG_SERVICE_PORT)
    }
}

/// Vault connection settings for the credential-agent sidecars
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultSpec {
    /// Vault server address
    pub address: String,

    /// Image running the credential agent
    pub agent_image: String,

    /// Kubernetes auth mount path in Vault (default "kubernetes")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_mount_path: Option<String>,

    /// Prefix for the Vault role names (`<prefix>-operator`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_prefix: Option<String>,

    /// KV engine mount for tenant secrets (default "customers")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_mount: Option<String>,

    /// Secret holding a bootstrap Vault token, required when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<SecretRef>,
}

impl VaultSpec {
    /// Auth mount path with the default applied
    pub fn auth_mount_path(&self) -> &str {
        self.auth_mount_path.as_deref().unwrap_or("kubernetes")
    }

    /// Role prefix with the default applied
    pub fn role_prefix(&self) -> &str {
        self.role_prefix.as_deref().unwrap_or("weft")
    }

    /// Engine mount with the default applied
    pub fn engine_mount(&self) -> &str {
        self.engine_mount.as_deref().unwrap_or("customers")
    }
}

/// WeftCore status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeftCoreStatus {
    /// Generation observed by the last successful reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Service account the operator runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_service_account: Option<String>,

    /// URL workloads use to reach the metadata API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_api_url: Option<String>,
}
