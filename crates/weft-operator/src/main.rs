//! Weft operator - converges the platform core, workflow runs, webhook
//! triggers, and tenants

mod config;
mod controller;
mod controller_runner;
mod crds;

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use weft_common::events::KubeEventPublisher;
use weft_common::kube_utils::create_client;
use weft_common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use weft_converge::KubeStore;
use weft_deps::DependencyManager;

use crate::config::OperatorConfig;
use crate::controller::Context;

/// Reporting component of published Events
const CONTROLLER_NAME: &str = "weft-operator";

/// Weft - control plane operator for workflow runs and tenants
#[derive(Parser, Debug)]
#[command(name = "weft-operator", version, about, long_about = None)]
struct Cli {
    /// Print every CRD as YAML and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs both rustls and token signing
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install the aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crds::crds_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: CONTROLLER_NAME.to_string(),
        otlp_endpoint: cli.config.otlp_endpoint.clone(),
        json: !cli.config.log_text,
        ..Default::default()
    })?;

    let result = run(cli.config).await;
    shutdown_telemetry();
    result
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    info!(
        system_namespace = %config.system_namespace,
        concurrency = config.concurrency,
        "Starting Weft operator"
    );
    let client = create_client(config.kubeconfig.as_deref()).await?;
    crds::ensure_crds_installed(&client).await?;

    let manager = Arc::new(DependencyManager::new());
    let ctx = Arc::new(Context::new(
        Arc::new(KubeStore::new(client.clone())),
        config.deps_context(manager.clone()),
        Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
        config.signing_key(),
    ));

    let controllers =
        controller_runner::build_controllers(client, ctx, manager, config.concurrency);
    futures::future::join_all(controllers).await;

    info!("Controllers stopped, shutting down");
    Ok(())
}
