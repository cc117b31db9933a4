//! Settings shared by every graph

use std::sync::Arc;

use chrono::Duration;

use weft_common::WEFT_SYSTEM_NAMESPACE;
use weft_converge::WaiterConfig;
use weft_identity::WEFT_METADATA_API_AUDIENCE_V1;

use crate::manager::DependencyManager;

/// Default lifetime of step tokens
pub const DEFAULT_RUN_TOKEN_TTL_HOURS: i64 = 24;

/// Default `iss` claim
pub const DEFAULT_ISSUER_NAME: &str = "weft-operator";

/// Default secret-engine mount for workload secrets
pub const DEFAULT_VAULT_ENGINE: &str = "customers";

/// Everything a graph needs besides the store and its top-level object
#[derive(Clone, Debug)]
pub struct DepsContext {
    /// Shared dependency manager
    pub manager: Arc<DependencyManager>,
    /// Namespace of the platform core
    pub system_namespace: String,
    /// `iss` claim of issued tokens
    pub issuer_name: String,
    /// `aud` claim of issued tokens, also handed to the metadata API
    pub audience: String,
    /// Lifetime of step tokens
    pub run_token_ttl: Duration,
    /// Secret-engine mount workload secrets live under
    pub vault_engine: String,
    /// Metadata-API URL handed to workloads; none leaves it to the image
    pub metadata_api_url: Option<String>,
    /// Poll settings for service-account tokens
    pub waiter: WaiterConfig,
}

impl DepsContext {
    /// Context with default settings around `manager`
    pub fn new(manager: Arc<DependencyManager>) -> Self {
        Self {
            manager,
            system_namespace: WEFT_SYSTEM_NAMESPACE.to_string(),
            issuer_name: DEFAULT_ISSUER_NAME.to_string(),
            audience: WEFT_METADATA_API_AUDIENCE_V1.to_string(),
            run_token_ttl: Duration::hours(DEFAULT_RUN_TOKEN_TTL_HOURS),
            vault_engine: DEFAULT_VAULT_ENGINE.to_string(),
            metadata_api_url: None,
            waiter: WaiterConfig::default(),
        }
    }
}
