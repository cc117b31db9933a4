//! WebhookTrigger CRD: a long-running webhook receiver that starts runs

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::core::DEFAULT_WEBHOOK_PORT;
use super::types::{preserve_unknown_fields, Condition, SecretRef};

/// A webhook receiver deployed per trigger.
///
/// Example:
/// ```yaml
/// apiVersion: weft.dev/v1alpha1
/// kind: WebhookTrigger
/// metadata:
///   name: github-push
///   namespace: tenant-acme
/// spec:
///   image: ghcr.io/weft/webhook:v0.1.0
///   eventSinkSecretRef:
///     name: github-webhook-secret
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "weft.dev",
    version = "v1alpha1",
    kind = "WebhookTrigger",
    namespaced,
    status = "WebhookTriggerStatus",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTriggerSpec {
    /// Container image serving the webhook
    pub image: String,

    /// Shell lines the receiver runs per event
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<String>,

    /// Environment variables for the receiver
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Free-form trigger spec, resolved by the metadata API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: Option<serde_json::Value>,

    /// Port the receiver listens on (default 8443)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Secret holding the event sink credentials; must exist before reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_sink_secret_ref: Option<SecretRef>,
}

impl WebhookTriggerSpec {
    /// Listen port with the default applied
    pub fn port(&self) -> i32 {
        self.port.unwrap_or(DEFAULT_WEBHOOK_PORT)
    }
}

/// WebhookTrigger status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTriggerStatus {
    /// Generation observed by the last successful reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Namespace the receiver runs in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// In-cluster URL of the receiver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
