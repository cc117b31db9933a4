//! Entry points the reconcilers call
//!
//! Each `apply_*` runs one full cycle over a top-level object: construct the
//! graph, load live state, configure, persist with the anchor first, then the
//! workload stage where there is one. The populated graph is returned so the
//! caller can derive status from it. Errors are permanent unless they are
//! [`Error::Transient`](weft_common::Error::Transient).

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, instrument};

use weft_common::crd::{Tenant, WebhookTrigger, WeftCore, WorkflowRun};
use weft_common::Result;
use weft_converge::{Loader, ObjectStore, Persister};
use weft_identity::Issuer;

use crate::context::DepsContext;
use crate::platform::CoreDeps;
use crate::run::RunDeps;
use crate::tenant::{TenantDeletion, TenantDeps};
use crate::trigger::TriggerDeps;

/// Converge the platform core
#[instrument(skip_all, fields(namespace = ?core.namespace(), name = %core.name_any()))]
pub async fn apply_core_deps(
    store: &dyn ObjectStore,
    ctx: &DepsContext,
    core: &WeftCore,
    now: DateTime<Utc>,
) -> Result<CoreDeps> {
    let mut deps = CoreDeps::new(ctx, core)?;
    if !deps.load(store).await? {
        debug!("Platform core not fully present yet");
    }
    deps.configure(core, now)?;
    deps.persist(store).await?;
    Ok(deps)
}

/// Converge a workflow run, issuing step tokens with `issuer`
#[instrument(skip_all, fields(namespace = ?run.namespace(), name = %run.name_any()))]
pub async fn apply_workflow_run_deps(
    store: &dyn ObjectStore,
    ctx: &DepsContext,
    run: &WorkflowRun,
    issuer: &dyn Issuer,
    now: DateTime<Utc>,
) -> Result<RunDeps> {
    let mut deps = RunDeps::new(ctx, run)?;
    if !deps.load(store).await? {
        debug!("Workflow run infrastructure not fully present yet");
    }
    deps.configure(run)?;
    deps.persist(store).await?;
    deps.apply_workloads(store, run, issuer, now).await?;
    Ok(deps)
}

/// Converge a webhook trigger, issuing its token with `issuer`
#[instrument(skip_all, fields(namespace = ?trigger.namespace(), name = %trigger.name_any()))]
pub async fn apply_webhook_trigger_deps(
    store: &dyn ObjectStore,
    ctx: &DepsContext,
    trigger: &WebhookTrigger,
    issuer: &dyn Issuer,
    now: DateTime<Utc>,
) -> Result<TriggerDeps> {
    let mut deps = TriggerDeps::new(ctx, trigger)?;
    if !deps.load(store).await? {
        debug!("Webhook trigger not fully present yet");
    }
    deps.configure(trigger)?;
    deps.persist(store).await?;
    deps.apply_workloads(store, trigger, issuer, now).await?;
    Ok(deps)
}

/// Converge a tenant
#[instrument(skip_all, fields(namespace = ?tenant.namespace(), name = %tenant.name_any()))]
pub async fn apply_tenant_deps(
    store: &dyn ObjectStore,
    ctx: &DepsContext,
    tenant: &Tenant,
) -> Result<TenantDeps> {
    let mut deps = TenantDeps::new(ctx, tenant);
    if !deps.load(store).await? {
        debug!("Tenant not fully present yet");
    }
    deps.configure(tenant)?;
    deps.persist(store).await?;
    Ok(deps)
}

/// Remove the platform core's cluster-scoped claims and its anchor
#[instrument(skip_all, fields(namespace = ?core.namespace(), name = %core.name_any()))]
pub async fn delete_core_deps(
    store: &dyn ObjectStore,
    ctx: &DepsContext,
    core: &WeftCore,
) -> Result<()> {
    CoreDeps::new(ctx, core)?.delete(store, core).await
}

/// Remove a tenant's namespace if it claimed it, else only its anchor
#[instrument(skip_all, fields(namespace = ?tenant.namespace(), name = %tenant.name_any()))]
pub async fn delete_tenant_deps(
    store: &dyn ObjectStore,
    ctx: &DepsContext,
    tenant: &Tenant,
) -> Result<TenantDeletion> {
    TenantDeps::new(ctx, tenant).delete(store, tenant).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use weft_common::crd::{StepSpec, TenantSpec, WebhookTriggerSpec, WorkflowRunSpec, WorkflowSpec};
    use weft_common::Error;
    use weft_converge::memory::{MemoryStore, Verb};
    use weft_converge::ObjectKey;
    use weft_identity::signing_key::generate_signing_key;
    use weft_identity::Es256Issuer;

    use crate::manager::DependencyManager;
    use crate::naming::{self, OwnerKind};
    use crate::run::WORKFLOW_KEY;

    fn ctx() -> DepsContext {
        DepsContext::new(Arc::new(DependencyManager::new()))
    }

    #[tokio::test]
    async fn tenant_apply_then_delete() {
        let store = MemoryStore::new();
        let mut tenant = Tenant::new("acme", TenantSpec::default());
        tenant.metadata.namespace = Some("customers".to_string());
        let tenant = store.insert(&tenant);

        let deps = apply_tenant_deps(&store, &ctx(), &tenant).await.unwrap();
        assert_eq!(deps.status(&tenant).namespace.as_deref(), Some("customers-acme"));
        assert_eq!(
            delete_tenant_deps(&store, &ctx(), &tenant).await.unwrap(),
            TenantDeletion::NamespaceDeleted
        );
    }

    #[tokio::test]
    async fn run_and_trigger_sharing_a_name_keep_separate_children() {
        let store = MemoryStore::new().with_token_controller();
        store.insert(&Namespace {
            metadata: ObjectMeta {
                name: Some("tenant-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut run = WorkflowRun::new(
            "ci",
            WorkflowRunSpec {
                workflow: WorkflowSpec {
                    name: Some("ci".to_string()),
                    steps: vec![StepSpec {
                        name: "build".to_string(),
                        image: "alpine:3".to_string(),
                        ..Default::default()
                    }],
                },
                ..Default::default()
            },
        );
        run.metadata.namespace = Some("tenant-a".to_string());
        let run = store.insert(&run);
        let mut trigger = WebhookTrigger::new(
            "ci",
            WebhookTriggerSpec {
                image: "weft/webhook:1".to_string(),
                ..Default::default()
            },
        );
        trigger.metadata.namespace = Some("tenant-a".to_string());
        let trigger = store.insert(&trigger);
        let issuer = Es256Issuer::from_pkcs8(&generate_signing_key().unwrap()).unwrap();

        apply_workflow_run_deps(&store, &ctx(), &run, &issuer, Utc::now())
            .await
            .ok()
            .unwrap();
        apply_webhook_trigger_deps(&store, &ctx(), &trigger, &issuer, Utc::now())
            .await
            .ok()
            .unwrap();
        // A second run cycle must not find the trigger's objects in its way
        apply_workflow_run_deps(&store, &ctx(), &run, &issuer, Utc::now())
            .await
            .ok()
            .unwrap();

        let immutable = |kind| {
            store
                .get_typed::<ConfigMap>(&ObjectKey::namespaced(
                    "tenant-a",
                    naming::immutable_config_map(kind, "ci"),
                ))
                .unwrap()
                .data
                .unwrap()
        };
        assert!(immutable(OwnerKind::Run).contains_key(WORKFLOW_KEY));
        assert!(!immutable(OwnerKind::Trigger).contains_key(WORKFLOW_KEY));
        for kind in [OwnerKind::Run, OwnerKind::Trigger] {
            assert!(store.contains::<ConfigMap>(&ObjectKey::namespaced(
                "tenant-a",
                naming::anchor(kind, "ci")
            )));
        }
    }

    #[tokio::test]
    async fn failed_write_stops_the_cycle() {
        let store = MemoryStore::new().with_token_controller();
        let mut trigger = WebhookTrigger::new(
            "github",
            WebhookTriggerSpec {
                image: "weft/webhook:1".to_string(),
                ..Default::default()
            },
        );
        trigger.metadata.namespace = Some("tenant-a".to_string());
        let trigger = store.insert(&trigger);
        store.fail_next(Verb::Create, "Role", "github-trigger-metadata-api", 500);
        let issuer = Es256Issuer::from_pkcs8(&generate_signing_key().unwrap()).unwrap();

        let err = apply_webhook_trigger_deps(&store, &ctx(), &trigger, &issuer, Utc::now())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Kube { .. }));
        assert!(!store.contains::<k8s_openapi::api::apps::v1::Deployment>(
            &ObjectKey::namespaced("tenant-a", "github-webhook")
        ));
    }
}
