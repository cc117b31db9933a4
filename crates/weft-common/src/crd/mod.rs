//! Custom Resource Definitions for Weft
//!
//! The four top-level objects reconciled by the operator: the platform core,
//! workflow runs, webhook triggers, and tenants.

mod core;
mod run;
mod tenant;
mod trigger;
mod types;

pub use self::core::{
    LogServiceSpec, MetadataApiSpec, OperatorSpec, VaultSpec, WeftCore, WeftCoreSpec,
    WeftCoreStatus, DEFAULT_LOG_SERVICE_PORT, DEFAULT_METADATA_API_PORT, DEFAULT_WEBHOOK_PORT,
};
pub use run::{StepSpec, StepStatus, WorkflowRun, WorkflowRunSpec, WorkflowRunStatus, WorkflowSpec};
pub use tenant::{NamespaceTemplate, Tenant, TenantSpec, TenantStatus};
pub use trigger::{WebhookTrigger, WebhookTriggerSpec, WebhookTriggerStatus};
pub use types::{
    preserve_unknown_fields, set_condition, ComponentSpec, Condition, ConditionStatus, SecretRef,
    CONDITION_READY,
};

use kube::CustomResourceExt;

/// Every CRD the operator serves, in installation order
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        WeftCore::crd(),
        Tenant::crd(),
        WorkflowRun::crd(),
        WebhookTrigger::crd(),
    ]
}
