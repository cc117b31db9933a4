//! Workload identity claims
//!
//! The claim set binds a workload's cluster identity (namespace, delegated
//! service-account token) to its application identity (run or trigger, step
//! name, tenant and domain) and to the storage locations it may use.

use serde::{Deserialize, Serialize};

/// Audience every workload token is issued for
pub const WEFT_METADATA_API_AUDIENCE_V1: &str = "metadata-api.weft.dev/v1";

/// Signed claim set carried in the `weft.dev/token` annotation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer
    pub iss: String,
    /// Audiences
    pub aud: Vec<String>,
    /// Subject, `<plural>/<hex sha256>`
    pub sub: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Not before (unix seconds)
    pub nbf: i64,
    /// Expiry (unix seconds); unset for long-running workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Cluster identity
    #[serde(rename = "weft.dev/kubernetes")]
    pub kubernetes: KubernetesClaims,

    /// Secret storage locations
    #[serde(rename = "weft.dev/vault")]
    pub vault: VaultClaims,

    /// Domain identifier copied from the owning object
    #[serde(
        rename = "weft.dev/domain-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub domain_id: Option<String>,

    /// Tenant identifier copied from the owning object
    #[serde(
        rename = "weft.dev/tenant-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tenant_id: Option<String>,

    /// Workflow run the workload belongs to
    #[serde(
        rename = "weft.dev/run-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub run_id: Option<String>,

    /// Step or trigger name
    #[serde(rename = "weft.dev/name")]
    pub name: String,
}

/// Cluster identity of the workload
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesClaims {
    /// Working namespace
    pub namespace_name: String,
    /// Uid of the working namespace
    pub namespace_uid: String,
    /// Delegated bearer token of the metadata-API service account
    pub service_account_token: String,
    /// ConfigMap holding the immutable spec
    pub immutable_config_map_name: String,
    /// ConfigMap holding outputs and conditions
    pub mutable_config_map_name: String,
}

/// Secret storage locations the bearer may read
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultClaims {
    /// KV engine mount
    pub engine_path: String,
    /// Path of the tenant's secrets
    pub secret_path: String,
    /// Path of the tenant's connections
    pub connection_path: String,
}

impl Claims {
    /// Whether the audience list contains `audience`
    pub fn has_audience(&self, audience: &str) -> bool {
        self.aud.iter().any(|a| a == audience)
    }
}
