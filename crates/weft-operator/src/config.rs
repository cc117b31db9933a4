//! Operator settings
//!
//! Every setting is a flag with a `WEFT_*` environment fallback. The platform
//! core's operator Deployment sets the environment, so flags are mostly for
//! running the operator outside the cluster.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use weft_common::WEFT_SYSTEM_NAMESPACE;
use weft_converge::{ObjectKey, WaiterConfig};
use weft_deps::context::{DEFAULT_ISSUER_NAME, DEFAULT_RUN_TOKEN_TTL_HOURS, DEFAULT_VAULT_ENGINE};
use weft_deps::{DependencyManager, DepsContext};
use weft_identity::WEFT_METADATA_API_AUDIENCE_V1;

/// Operator configuration, built once in `main`
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace of the platform core
    #[arg(long, env = "WEFT_SYSTEM_NAMESPACE", default_value = WEFT_SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    /// Maximum concurrent reconciles per controller (0 = unbounded)
    #[arg(long, env = "WEFT_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// `iss` claim of issued workload tokens
    #[arg(long, env = "WEFT_ISSUER_NAME", default_value = DEFAULT_ISSUER_NAME)]
    pub issuer_name: String,

    /// Metadata-API URL handed to workloads
    #[arg(long, env = "WEFT_METADATA_API_URL")]
    pub metadata_api_url: Option<String>,

    /// `aud` claim of issued workload tokens
    #[arg(long, env = "WEFT_METADATA_API_AUDIENCE", default_value = WEFT_METADATA_API_AUDIENCE_V1)]
    pub metadata_api_audience: String,

    /// Lifetime of workflow step tokens, in hours
    #[arg(long, env = "WEFT_RUN_TOKEN_TTL_HOURS", default_value_t = DEFAULT_RUN_TOKEN_TTL_HOURS)]
    pub run_token_ttl_hours: i64,

    /// Secret-engine mount workload secrets live under
    #[arg(long, env = "WEFT_VAULT_ENGINE", default_value = DEFAULT_VAULT_ENGINE)]
    pub vault_engine: String,

    /// Secret in the system namespace holding the workload signing key
    #[arg(long, env = "WEFT_SIGNING_KEY_SECRET", default_value = "weft-signing-key")]
    pub signing_key_secret: String,

    /// Delay between service-account token polls, in milliseconds
    #[arg(long, env = "WEFT_WAITER_INTERVAL_MS", default_value_t = 250)]
    pub waiter_interval_ms: u64,

    /// Bound on one service-account token wait, in seconds
    #[arg(long, env = "WEFT_WAITER_TIMEOUT_SECS", default_value_t = 120)]
    pub waiter_timeout_secs: u64,

    /// Kubeconfig to use instead of in-cluster configuration
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// OTLP gRPC endpoint for traces
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Log human-readable lines instead of JSON
    #[arg(long, env = "WEFT_LOG_TEXT")]
    pub log_text: bool,
}

impl OperatorConfig {
    /// Graph settings around `manager`
    pub fn deps_context(&self, manager: Arc<DependencyManager>) -> DepsContext {
        DepsContext {
            system_namespace: self.system_namespace.clone(),
            issuer_name: self.issuer_name.clone(),
            audience: self.metadata_api_audience.clone(),
            run_token_ttl: chrono::Duration::hours(self.run_token_ttl_hours),
            vault_engine: self.vault_engine.clone(),
            metadata_api_url: self.metadata_api_url.clone(),
            waiter: WaiterConfig {
                interval: Duration::from_millis(self.waiter_interval_ms),
                timeout: Duration::from_secs(self.waiter_timeout_secs),
            },
            ..DepsContext::new(manager)
        }
    }

    /// Where run and trigger reconcilers read the signing key from
    pub fn signing_key(&self) -> ObjectKey {
        ObjectKey::namespaced(&self.system_namespace, &self.signing_key_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    fn parse(args: &[&str]) -> OperatorConfig {
        let argv = std::iter::once("weft-operator").chain(args.iter().copied());
        TestCli::try_parse_from(argv).unwrap().config
    }

    #[test]
    fn defaults_match_the_graph_defaults() {
        let config = parse(&[]);
        let ctx = config.deps_context(Arc::new(DependencyManager::new()));
        let defaults = DepsContext::new(Arc::new(DependencyManager::new()));

        assert_eq!(ctx.system_namespace, defaults.system_namespace);
        assert_eq!(ctx.issuer_name, defaults.issuer_name);
        assert_eq!(ctx.audience, defaults.audience);
        assert_eq!(ctx.run_token_ttl, defaults.run_token_ttl);
        assert_eq!(ctx.waiter.timeout, defaults.waiter.timeout);
        assert_eq!(ctx.waiter.interval, defaults.waiter.interval);
    }

    #[test]
    fn flags_flow_into_the_graph_context() {
        let config = parse(&[
            "--system-namespace",
            "platform",
            "--run-token-ttl-hours",
            "2",
            "--metadata-api-url",
            "https://meta.example.com",
            "--waiter-timeout-secs",
            "5",
        ]);
        let ctx = config.deps_context(Arc::new(DependencyManager::new()));

        assert_eq!(ctx.system_namespace, "platform");
        assert_eq!(ctx.run_token_ttl, chrono::Duration::hours(2));
        assert_eq!(ctx.metadata_api_url.as_deref(), Some("https://meta.example.com"));
        assert_eq!(ctx.waiter.timeout, Duration::from_secs(5));
        assert_eq!(
            config.signing_key(),
            ObjectKey::namespaced("platform", "weft-signing-key")
        );
    }
}
