//! Tenant reconciler
//!
//! A tenant's working namespace is usually not the tenant's own namespace,
//! so owner references cannot clean it up. Deletion goes through a
//! finalizer, and a namespace the tenant did not create is kept.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument};

use weft_common::crd::Tenant;
use weft_common::events::{actions, reasons};
use weft_common::Result;
use weft_deps::{apply_tenant_deps, delete_tenant_deps, TenantDeletion};

use super::{add_finalizer, applied, has_finalizer, patch_status, remove_finalizer, Context};

/// Reconcile a Tenant
#[instrument(skip_all, fields(namespace = ?tenant.namespace(), name = %tenant.name_any()))]
pub async fn reconcile(tenant: Arc<Tenant>, ctx: Arc<Context>) -> Result<Action> {
    let Some(tenant) = ctx.refetch(tenant.as_ref()).await? else {
        return Ok(Action::await_change());
    };
    if tenant.metadata.deletion_timestamp.is_some() {
        return cleanup(&tenant, &ctx).await;
    }
    let tenant = add_finalizer(ctx.store.as_ref(), &tenant).await?;

    if let Err(e) = apply(&tenant, &ctx).await {
        ctx.publish_failure(&tenant, actions::RECONCILE, &e).await;
        return Err(e);
    }
    Ok(applied(&tenant))
}

async fn apply(tenant: &Tenant, ctx: &Context) -> Result<()> {
    if let Some(secret) = &tenant.spec.event_sink_secret_ref {
        let namespace = tenant.namespace().unwrap_or_default();
        ctx.require_secret(secret, &namespace).await?;
    }

    let store = ctx.store.as_ref();
    let deps = apply_tenant_deps(store, &ctx.deps, tenant).await?;
    patch_status(store, tenant, &deps.status(tenant)).await?;
    ctx.publish_normal(
        tenant,
        reasons::DEPENDENCIES_APPLIED,
        actions::RECONCILE,
        format!("Namespace {} applied", deps.namespace_name()),
    )
    .await;
    Ok(())
}

async fn cleanup(tenant: &Tenant, ctx: &Context) -> Result<Action> {
    if !has_finalizer(tenant) {
        return Ok(Action::await_change());
    }
    let store = ctx.store.as_ref();
    let deletion = match delete_tenant_deps(store, &ctx.deps, tenant).await {
        Ok(deletion) => deletion,
        Err(e) => {
            ctx.publish_failure(tenant, actions::DELETE, &e).await;
            return Err(e);
        }
    };
    remove_finalizer(store, tenant).await?;

    let namespace = tenant.working_namespace();
    match deletion {
        TenantDeletion::NamespaceDeleted => {
            info!(%namespace, "Tenant namespace deleted");
            ctx.publish_normal(
                tenant,
                reasons::DEPENDENCIES_DELETED,
                actions::DELETE,
                format!("Namespace {namespace} deleted"),
            )
            .await;
        }
        TenantDeletion::NamespaceRetained => {
            info!(%namespace, "Tenant namespace is shared, retained it");
            ctx.publish_normal(
                tenant,
                reasons::NAMESPACE_RETAINED,
                actions::DELETE,
                format!("Namespace {namespace} was not created by this tenant and was kept"),
            )
            .await;
        }
    }
    Ok(Action::await_change())
}
