//! WebhookTrigger reconciler

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, instrument};

use weft_common::crd::WebhookTrigger;
use weft_common::events::{actions, reasons};
use weft_common::Result;
use weft_deps::apply_webhook_trigger_deps;
use weft_deps::platform::signing_key::load_issuer;

use super::{applied, patch_status, Context};

/// Reconcile a WebhookTrigger
#[instrument(skip_all, fields(namespace = ?trigger.namespace(), name = %trigger.name_any()))]
pub async fn reconcile(trigger: Arc<WebhookTrigger>, ctx: Arc<Context>) -> Result<Action> {
    let Some(trigger) = ctx.refetch(trigger.as_ref()).await? else {
        return Ok(Action::await_change());
    };
    if trigger.metadata.deletion_timestamp.is_some() {
        debug!("Trigger is being deleted, leaving it to garbage collection");
        return Ok(Action::await_change());
    }

    if let Err(e) = apply(&trigger, &ctx).await {
        ctx.publish_failure(&trigger, actions::RECONCILE, &e).await;
        return Err(e);
    }
    Ok(applied(&trigger))
}

async fn apply(trigger: &WebhookTrigger, ctx: &Context) -> Result<()> {
    if let Some(secret) = &trigger.spec.event_sink_secret_ref {
        let namespace = trigger.namespace().unwrap_or_default();
        ctx.require_secret(secret, &namespace).await?;
    }

    let store = ctx.store.as_ref();
    let issuer = load_issuer(store, &ctx.signing_key).await?;
    let deps = apply_webhook_trigger_deps(store, &ctx.deps, trigger, &issuer, Utc::now()).await?;
    let status = deps.status(trigger);
    patch_status(store, trigger, &status).await?;

    let note = match &status.url {
        Some(url) => format!("Webhook receiver listening at {url}"),
        None => "Webhook receiver applied".to_string(),
    };
    ctx.publish_normal(trigger, reasons::DEPENDENCIES_APPLIED, actions::RECONCILE, note)
        .await;
    Ok(())
}
