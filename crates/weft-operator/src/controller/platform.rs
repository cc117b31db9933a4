//! WeftCore reconciler
//!
//! The platform core claims cluster-scoped RBAC that garbage collection
//! cannot remove, so it carries a finalizer.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument};

use weft_common::crd::WeftCore;
use weft_common::events::{actions, reasons};
use weft_common::Result;
use weft_deps::{apply_core_deps, delete_core_deps};

use super::{add_finalizer, applied, has_finalizer, patch_status, remove_finalizer, Context};

/// Reconcile a WeftCore
#[instrument(skip_all, fields(namespace = ?core.namespace(), name = %core.name_any()))]
pub async fn reconcile(core: Arc<WeftCore>, ctx: Arc<Context>) -> Result<Action> {
    let Some(core) = ctx.refetch(core.as_ref()).await? else {
        return Ok(Action::await_change());
    };
    if core.metadata.deletion_timestamp.is_some() {
        return cleanup(&core, &ctx).await;
    }
    let core = add_finalizer(ctx.store.as_ref(), &core).await?;

    if let Err(e) = apply(&core, &ctx).await {
        ctx.publish_failure(&core, actions::RECONCILE, &e).await;
        return Err(e);
    }
    Ok(applied(&core))
}

async fn apply(core: &WeftCore, ctx: &Context) -> Result<()> {
    let namespace = core
        .namespace()
        .unwrap_or_else(|| ctx.deps.system_namespace.clone());
    if let Some(secret) = core.spec.vault.as_ref().and_then(|v| v.token_secret_ref.as_ref()) {
        ctx.require_secret(secret, &namespace).await?;
    }

    let store = ctx.store.as_ref();
    let deps = apply_core_deps(store, &ctx.deps, core, Utc::now()).await?;
    patch_status(store, core, &deps.status(core)).await?;
    ctx.publish_normal(
        core,
        reasons::DEPENDENCIES_APPLIED,
        actions::RECONCILE,
        "Platform core applied".to_string(),
    )
    .await;
    Ok(())
}

async fn cleanup(core: &WeftCore, ctx: &Context) -> Result<Action> {
    if !has_finalizer(core) {
        return Ok(Action::await_change());
    }
    let store = ctx.store.as_ref();
    if let Err(e) = delete_core_deps(store, &ctx.deps, core).await {
        ctx.publish_failure(core, actions::DELETE, &e).await;
        return Err(e);
    }
    remove_finalizer(store, core).await?;
    info!("Platform core dependencies deleted");
    ctx.publish_normal(
        core,
        reasons::DEPENDENCIES_DELETED,
        actions::DELETE,
        "Cluster-scoped dependencies released".to_string(),
    )
    .await;
    Ok(Action::await_change())
}
