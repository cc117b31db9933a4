//! Common types for Weft: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Weft CRDs
pub const WEFT_API_GROUP: &str = "weft.dev";

/// Namespace for Weft system resources (operator, metadata API, log service)
pub const WEFT_SYSTEM_NAMESPACE: &str = "weft-system";

/// Field manager used for every write the control plane makes
pub const FIELD_MANAGER: &str = "weft-operator";

// =============================================================================
// Labels
// =============================================================================

/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of the managed-by label for Weft-managed resources
pub const LABEL_MANAGED_BY_WEFT: &str = "weft";
/// Standard name label key
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Standard component label key
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// Label marking dependency anchor objects
pub const LABEL_ANCHOR: &str = "weft.dev/anchor";
/// Label carrying the workflow run name
pub const LABEL_RUN: &str = "weft.dev/run";
/// Label carrying the step name within a run
pub const LABEL_STEP: &str = "weft.dev/step";
/// Label carrying the webhook trigger name
pub const LABEL_TRIGGER: &str = "weft.dev/trigger";
/// Label carrying the tenant name
pub const LABEL_TENANT: &str = "weft.dev/tenant";
/// Label used as a network policy pod selector
pub const LABEL_NETWORK_POLICY: &str = "weft.dev/network-policy";

// =============================================================================
// Annotations
// =============================================================================

/// Annotation holding the serialized dependency-of record
pub const ANNOTATION_DEPENDENCY_OF: &str = "weft.dev/dependency-of";
/// Annotation holding a signed workload identity token
pub const ANNOTATION_TOKEN: &str = "weft.dev/token";
/// Annotation holding the subject of the signed workload identity token
pub const ANNOTATION_TOKEN_SUBJECT: &str = "weft.dev/token-subject";
/// Annotation carrying the domain identifier on top-level objects
pub const ANNOTATION_DOMAIN_ID: &str = "weft.dev/domain-id";
/// Annotation carrying the tenant identifier on top-level objects
pub const ANNOTATION_TENANT_ID: &str = "weft.dev/tenant-id";
