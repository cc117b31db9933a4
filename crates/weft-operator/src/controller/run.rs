//! WorkflowRun reconciler
//!
//! Everything a run creates lives in its namespace under the run's anchor,
//! so garbage collection handles deletion and no finalizer is needed.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, instrument};

use weft_common::crd::WorkflowRun;
use weft_common::events::{actions, reasons};
use weft_common::Result;
use weft_deps::apply_workflow_run_deps;
use weft_deps::platform::signing_key::load_issuer;

use super::{applied, patch_status, Context};

/// Reconcile a WorkflowRun
#[instrument(skip_all, fields(namespace = ?run.namespace(), name = %run.name_any()))]
pub async fn reconcile(run: Arc<WorkflowRun>, ctx: Arc<Context>) -> Result<Action> {
    let Some(run) = ctx.refetch(run.as_ref()).await? else {
        return Ok(Action::await_change());
    };
    if run.metadata.deletion_timestamp.is_some() {
        debug!("Run is being deleted, leaving it to garbage collection");
        return Ok(Action::await_change());
    }

    if let Err(e) = apply(&run, &ctx).await {
        ctx.publish_failure(&run, actions::RECONCILE, &e).await;
        return Err(e);
    }
    Ok(applied(&run))
}

async fn apply(run: &WorkflowRun, ctx: &Context) -> Result<()> {
    let store = ctx.store.as_ref();
    let issuer = load_issuer(store, &ctx.signing_key).await?;
    let deps = apply_workflow_run_deps(store, &ctx.deps, run, &issuer, Utc::now()).await?;

    let status = deps.status(run);
    let previous = run.status.as_ref().map(|s| &s.steps);
    let issued: Vec<&str> = status
        .steps
        .keys()
        .filter(|step| !previous.is_some_and(|p| p.contains_key(*step)))
        .map(String::as_str)
        .collect();
    patch_status(store, run, &status).await?;

    if !issued.is_empty() {
        ctx.publish_normal(
            run,
            reasons::TOKEN_ISSUED,
            actions::ISSUE,
            format!("Issued tokens for steps {}", issued.join(", ")),
        )
        .await;
    }
    ctx.publish_normal(
        run,
        reasons::DEPENDENCIES_APPLIED,
        actions::RECONCILE,
        format!("{} step job(s) applied", status.steps.len()),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use weft_common::crd::{StepSpec, WorkflowRunSpec, WorkflowRunStatus, WorkflowSpec};
    use weft_common::Error;
    use weft_converge::memory::MemoryStore;
    use weft_converge::{ObjectKey, Persister};
    use weft_deps::platform::signing_key::SigningKeyDeps;

    use crate::controller::testing::{context, RecordingPublisher};

    async fn seed_signing_key(store: &MemoryStore) {
        let mut key = SigningKeyDeps::new(ObjectKey::namespaced("weft-system", "weft-signing-key"));
        key.configure(&Default::default()).unwrap();
        key.persist(store).await.unwrap();
    }

    fn seed_run(store: &MemoryStore, steps: &[&str]) -> Arc<WorkflowRun> {
        store.insert(&Namespace {
            metadata: ObjectMeta {
                name: Some("tenant-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut run = WorkflowRun::new(
            "run-42",
            WorkflowRunSpec {
                workflow: WorkflowSpec {
                    steps: steps
                        .iter()
                        .map(|name| StepSpec {
                            name: name.to_string(),
                            image: "alpine:3".to_string(),
                            ..Default::default()
                        })
                        .collect(),
                    name: Some("ci".to_string()),
                },
                parameters: BTreeMap::new(),
            },
        );
        run.metadata.namespace = Some("tenant-a".to_string());
        Arc::new(store.insert(&run))
    }

    fn run_key() -> ObjectKey {
        ObjectKey::namespaced("tenant-a", "run-42")
    }

    #[tokio::test]
    async fn steps_get_jobs_and_status_lists_them() {
        let store = Arc::new(MemoryStore::new().with_token_controller());
        let events = Arc::new(RecordingPublisher::default());
        seed_signing_key(&store).await;
        let run = seed_run(&store, &["build", "test"]);

        reconcile(run, context(store.clone(), events.clone())).await.unwrap();

        assert_eq!(store.list_typed::<Job>().len(), 2);
        let status: WorkflowRunStatus = store
            .get_typed::<WorkflowRun>(&run_key())
            .unwrap()
            .status
            .unwrap();
        assert_eq!(status.steps.len(), 2);
        assert!(status.steps["build"]
            .token_subject
            .as_deref()
            .is_some_and(|s| s.starts_with("steps/")));
        assert_eq!(
            events.reasons(),
            vec![reasons::TOKEN_ISSUED, reasons::DEPENDENCIES_APPLIED]
        );
    }

    #[tokio::test]
    async fn second_reconcile_issues_nothing_new() {
        let store = Arc::new(MemoryStore::new().with_token_controller());
        let events = Arc::new(RecordingPublisher::default());
        let ctx = context(store.clone(), events.clone());
        seed_signing_key(&store).await;
        let run = seed_run(&store, &["build"]);
        reconcile(run.clone(), ctx.clone()).await.unwrap();
        store.clear_ops();

        reconcile(run, ctx).await.unwrap();
        assert!(
            store.changes().iter().all(|op| op.kind == "WorkflowRun"),
            "{:?}",
            store.changes()
        );
        assert_eq!(
            events.reasons(),
            vec![
                reasons::TOKEN_ISSUED,
                reasons::DEPENDENCIES_APPLIED,
                reasons::DEPENDENCIES_APPLIED
            ]
        );
    }

    #[tokio::test]
    async fn missing_signing_key_is_retryable_and_creates_nothing() {
        let store = Arc::new(MemoryStore::new().with_token_controller());
        let events = Arc::new(RecordingPublisher::default());
        let run = seed_run(&store, &["build"]);

        let err = reconcile(run, context(store.clone(), events.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequiredSecretMissing { ref name, .. } if name == "weft-signing-key"));
        assert!(err.is_retryable());
        assert!(store.ops().is_empty());
        assert_eq!(events.reasons(), vec![reasons::SECRET_MISSING]);
    }

    #[tokio::test]
    async fn invalid_run_is_reported_as_validation_failure() {
        let store = Arc::new(MemoryStore::new().with_token_controller());
        let events = Arc::new(RecordingPublisher::default());
        seed_signing_key(&store).await;
        store.clear_ops();
        let run = seed_run(&store, &["build", "build"]);

        let err = reconcile(run, context(store.clone(), events.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.is_retryable());
        assert!(store.ops().is_empty());
        assert_eq!(events.reasons(), vec![reasons::VALIDATION_FAILED]);
    }
}
