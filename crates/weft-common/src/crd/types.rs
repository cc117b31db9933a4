//! Supporting types shared by the Weft CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported once a top-level object's dependencies converged
pub const CONDITION_READY: &str = "Ready";

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is met
    True,
    /// Condition is not met
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Convenience constructor for a True Ready condition
    pub fn ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CONDITION_READY, ConditionStatus::True, reason, message)
    }
}

/// Merge `next` into `conditions`, keeping the transition time when the
/// status of an existing condition of the same type did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, next: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(existing) => {
            let transitioned = existing.status != next.status;
            let last_transition_time = if transitioned {
                next.last_transition_time
            } else {
                existing.last_transition_time
            };
            *existing = Condition {
                last_transition_time,
                ..next
            };
        }
        None => conditions.push(next),
    }
}

/// Reference to a Secret by name, optionally in another namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,

    /// Secret namespace (defaults to the referencing object's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretRef {
    /// Namespace of the secret, falling back to `default_namespace`
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_namespace)
    }
}

/// Container image and scaling settings for a platform component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Container image reference
    pub image: String,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Number of replicas (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Extra environment variables for the main container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Extra annotations applied to the pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,
}

impl ComponentSpec {
    /// Replica count with the default applied
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

/// Schema for free-form JSON fields (`x-kubernetes-preserve-unknown-fields`)
pub fn preserve_unknown_fields(
    _: &mut schemars::gen::SchemaGenerator,
) -> schemars::schema::Schema {
    use schemars::schema::{InstanceType, Schema, SchemaObject};

    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_appends_new_types() {
        let mut conditions = vec![];
        set_condition(&mut conditions, Condition::ready("Applied", "ok"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_READY);
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_unchanged() {
        let mut first = Condition::ready("Applied", "first");
        first.last_transition_time = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap_or_default();
        let original_time = first.last_transition_time;
        let mut conditions = vec![first];

        set_condition(&mut conditions, Condition::ready("Applied", "second"));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "second");
        assert_eq!(conditions[0].last_transition_time, original_time);
    }

    #[test]
    fn set_condition_updates_transition_time_on_status_change() {
        let mut first = Condition::ready("Applied", "ok");
        first.last_transition_time = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap_or_default();
        let mut conditions = vec![first];

        set_condition(
            &mut conditions,
            Condition::new(CONDITION_READY, ConditionStatus::False, "Failed", "nope"),
        );

        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert!(conditions[0].last_transition_time.timestamp() > 1_000);
    }

    #[test]
    fn secret_ref_namespace_fallback() {
        let local = SecretRef {
            name: "token".to_string(),
            namespace: None,
        };
        assert_eq!(local.namespace_or("weft-system"), "weft-system");

        let remote = SecretRef {
            name: "token".to_string(),
            namespace: Some("vault".to_string()),
        };
        assert_eq!(remote.namespace_or("weft-system"), "vault");
    }

    #[test]
    fn component_replicas_default_to_one() {
        assert_eq!(ComponentSpec::default().replicas(), 1);
    }
}
