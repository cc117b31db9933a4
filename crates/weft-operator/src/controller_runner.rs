//! Controller runner - builds one controller future per top-level kind
//!
//! Anchors are the bridge back to the top-level object: an anchor in the
//! object's own namespace carries an owner reference (`owns`), one in another
//! namespace carries a DependencyOf record (`watches`, mapped through the
//! dependency manager).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use weft_common::crd::{Tenant, WebhookTrigger, WeftCore, WorkflowRun};
use weft_common::LABEL_ANCHOR;
use weft_deps::DependencyManager;

use crate::controller::{self, error_policy, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn anchors() -> WatcherConfig {
    watcher().labels(&format!("{LABEL_ANCHOR}=true"))
}

/// Build every controller
pub fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
    manager: Arc<DependencyManager>,
    concurrency: u16,
) -> Vec<ControllerFuture> {
    let config = ControllerConfig::default().concurrency(concurrency);
    let configmaps: Api<ConfigMap> = Api::all(client.clone());

    tracing::info!("- WeftCore controller");
    let cores = {
        let manager = manager.clone();
        Controller::new(Api::<WeftCore>::all(client.clone()), watcher())
            .with_config(config.clone())
            .owns(configmaps.clone(), anchors())
            .watches(configmaps.clone(), anchors(), move |cm| {
                manager.owners_of::<WeftCore>(&cm.metadata)
            })
            .shutdown_on_signal()
            .run(controller::platform::reconcile, error_policy::<WeftCore>, ctx.clone())
            .for_each(log_reconcile_result("WeftCore"))
    };

    tracing::info!("- WorkflowRun controller");
    let runs = {
        let manager = manager.clone();
        Controller::new(Api::<WorkflowRun>::all(client.clone()), watcher())
            .with_config(config.clone())
            .owns(configmaps.clone(), anchors())
            .watches(configmaps.clone(), anchors(), move |cm| {
                manager.owners_of::<WorkflowRun>(&cm.metadata)
            })
            .shutdown_on_signal()
            .run(controller::run::reconcile, error_policy::<WorkflowRun>, ctx.clone())
            .for_each(log_reconcile_result("WorkflowRun"))
    };

    tracing::info!("- WebhookTrigger controller");
    let triggers = {
        let manager = manager.clone();
        Controller::new(Api::<WebhookTrigger>::all(client.clone()), watcher())
            .with_config(config.clone())
            .owns(configmaps.clone(), anchors())
            .watches(configmaps.clone(), anchors(), move |cm| {
                manager.owners_of::<WebhookTrigger>(&cm.metadata)
            })
            .shutdown_on_signal()
            .run(controller::trigger::reconcile, error_policy::<WebhookTrigger>, ctx.clone())
            .for_each(log_reconcile_result("WebhookTrigger"))
    };

    tracing::info!("- Tenant controller");
    let tenants = Controller::new(Api::<Tenant>::all(client), watcher())
        .with_config(config)
        .owns(configmaps.clone(), anchors())
        .watches(configmaps, anchors(), move |cm| {
            manager.owners_of::<Tenant>(&cm.metadata)
        })
        .shutdown_on_signal()
        .run(controller::tenant::reconcile, error_policy::<Tenant>, ctx)
        .for_each(log_reconcile_result("Tenant"));

    vec![
        Box::pin(cores),
        Box::pin(runs),
        Box::pin(triggers),
        Box::pin(tenants),
    ]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
