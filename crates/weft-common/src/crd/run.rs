//! WorkflowRun CRD: one execution of a workflow

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, Condition};

/// A single run of a workflow, executed as one Job per step.
///
/// Example:
/// ```yaml
/// apiVersion: weft.dev/v1alpha1
/// kind: WorkflowRun
/// metadata:
///   name: run-42
///   namespace: tenant-acme
/// spec:
///   workflow:
///     steps:
///       - name: build
///         image: alpine:3
///         input: ["make build"]
///       - name: deploy
///         image: alpine:3
///         dependsOn: [build]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "weft.dev",
    version = "v1alpha1",
    kind = "WorkflowRun",
    namespaced,
    status = "WorkflowRunStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunSpec {
    /// Workflow definition being executed
    pub workflow: WorkflowSpec,

    /// Run parameters, made available to steps through the metadata API
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Workflow definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// Workflow name (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Steps in declaration order
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// One step of a workflow
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Step name, unique within the workflow
    pub name: String,

    /// Container image
    pub image: String,

    /// Shell lines executed in order (mutually exclusive with command)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<String>,

    /// Container command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Container args
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Free-form step spec, resolved by the metadata API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: Option<serde_json::Value>,

    /// Steps that must complete before this one starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// WorkflowRun status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStatus {
    /// Generation observed by the last successful reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Namespace the run's workloads execute in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Per-step provisioning state, keyed by step name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<String, StepStatus>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Provisioning state of one step
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    /// Job executing the step
    pub job: String,

    /// Subject of the step's workload identity token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_subject: Option<String>,
}

impl WorkflowRunSpec {
    /// Validate step names and dependencies
    pub fn validate(&self) -> Result<(), crate::Error> {
        let mut seen = std::collections::BTreeSet::new();
        for step in &self.workflow.steps {
            if step.name.is_empty() {
                return Err(crate::Error::validation("step name must not be empty"));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            if !step.input.is_empty() && !step.command.is_empty() {
                return Err(crate::Error::validation(format!(
                    "step '{}' sets both input and command",
                    step.name
                )));
            }
        }
        for step in &self.workflow.steps {
            if let Some(missing) = step
                .depends_on
                .iter()
                .find(|dep| !seen.contains(dep.as_str()))
            {
                return Err(crate::Error::validation(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.name, missing
                )));
            }
        }
        Ok(())
    }
}
