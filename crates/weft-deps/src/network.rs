//! NetworkPolicy shapes used by the workload and tenant graphs
//!
//! Specs are written as JSON and decoded, which keeps them readable next to
//! the manifests they correspond to.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::NetworkPolicySpec;
use serde_json::{json, Value};

use weft_common::{Result, LABEL_COMPONENT};

/// Component label value of metadata-API pods
pub const METADATA_API_COMPONENT: &str = "metadata-api";

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

fn egress(system_namespace: &str) -> Value {
    json!([
        {
            "to": [{
                "namespaceSelector": { "matchLabels": { NAMESPACE_NAME_LABEL: system_namespace } },
                "podSelector": { "matchLabels": { LABEL_COMPONENT: METADATA_API_COMPONENT } }
            }]
        },
        {
            "ports": [
                { "port": 53, "protocol": "UDP" },
                { "port": 53, "protocol": "TCP" }
            ]
        }
    ])
}

fn decode(value: Value) -> Result<NetworkPolicySpec> {
    Ok(serde_json::from_value(value)?)
}

/// No ingress; egress only to the metadata API and DNS
pub fn workload_policy(
    pods: &BTreeMap<String, String>,
    system_namespace: &str,
) -> Result<NetworkPolicySpec> {
    decode(json!({
        "podSelector": { "matchLabels": pods },
        "policyTypes": ["Ingress", "Egress"],
        "ingress": [],
        "egress": egress(system_namespace),
    }))
}

/// Like [`workload_policy`], plus ingress from anywhere on `port`
pub fn webhook_policy(
    pods: &BTreeMap<String, String>,
    port: i32,
    system_namespace: &str,
) -> Result<NetworkPolicySpec> {
    decode(json!({
        "podSelector": { "matchLabels": pods },
        "policyTypes": ["Ingress", "Egress"],
        "ingress": [{ "ports": [{ "port": port, "protocol": "TCP" }] }],
        "egress": egress(system_namespace),
    }))
}

/// Deny all ingress to every pod of a namespace
pub fn default_deny_ingress() -> Result<NetworkPolicySpec> {
    decode(json!({
        "podSelector": {},
        "policyTypes": ["Ingress"],
    }))
}
