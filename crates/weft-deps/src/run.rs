//! Workflow run graph
//!
//! Infrastructure first: anchor, the metadata-API access of the run, the
//! service account the steps run as, and a NetworkPolicy that only lets step
//! pods reach the metadata API and DNS. Once that is persisted and the
//! delegated token has been populated, one Job per step is created with a
//! signed token on its pod template. Jobs are never updated: their pod
//! template is immutable, and the token on it is issued exactly once.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Namespace, PodSpec, PodTemplateSpec, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use weft_common::crd::{
    set_condition, Condition, StepSpec, StepStatus, WorkflowRun, WorkflowRunStatus,
};
use weft_common::{
    Error, Result, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT, LABEL_NETWORK_POLICY, LABEL_RUN,
    LABEL_STEP,
};
use weft_converge::{
    Handle, Loader, Loaders, ObjectKey, ObjectStore, Owner, Persister, Persisters,
};
use weft_identity::{annotate_token, Issuer, WorkloadIdentity};

use crate::access::{apply_labels, WorkloadAccess};
use crate::anchor::DependencyAnchor;
use crate::context::DepsContext;
use crate::naming::{self, OwnerKind};
use crate::network;
use crate::pod::{token_subject, WorkloadContainer};

/// Immutable ConfigMap key holding the workflow definition
pub const WORKFLOW_KEY: &str = "workflow.json";
/// Immutable ConfigMap key holding the run parameters
pub const PARAMETERS_KEY: &str = "parameters.json";

/// Every child of one [`WorkflowRun`]
pub struct RunDeps {
    ctx: DepsContext,
    run: String,
    anchor: DependencyAnchor,
    namespace: Handle<Namespace>,
    /// ConfigMaps, delegated identity, and RBAC
    pub access: WorkloadAccess,
    /// Identity of the step pods
    pub steps_service_account: Handle<ServiceAccount>,
    /// Egress limited to the metadata API and DNS
    pub network_policy: Handle<NetworkPolicy>,
    /// One Job per step, by step name
    pub jobs: BTreeMap<String, Handle<Job>>,
}

fn run_labels(run: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_RUN.to_string(), run.to_string()),
        (LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_WEFT.to_string()),
    ])
}

impl RunDeps {
    /// Handles for every child of `run`
    pub fn new(ctx: &DepsContext, run: &WorkflowRun) -> Result<Self> {
        let name = run.name_any();
        let namespace = run
            .namespace()
            .ok_or_else(|| Error::validation_for(&name, "workflow run has no namespace"))?;
        let key = |child: String| ObjectKey::namespaced(&namespace, child);

        let jobs = run
            .spec
            .workflow
            .steps
            .iter()
            .map(|step| {
                let job = Handle::new(key(naming::step_job(&name, &step.name)), Job::default())
                    .create_only();
                (step.name.clone(), job)
            })
            .collect();

        Ok(Self {
            ctx: ctx.clone(),
            anchor: DependencyAnchor::new(key(naming::anchor(OwnerKind::Run, &name))),
            namespace: Handle::new(ObjectKey::cluster(&namespace), Namespace::default()),
            access: WorkloadAccess::new(&namespace, OwnerKind::Run, &name, ctx.waiter),
            steps_service_account: Handle::new(
                key(naming::steps_service_account(&name)),
                ServiceAccount::default(),
            ),
            network_policy: Handle::new(
                key(naming::workload_network_policy(OwnerKind::Run, &name)),
                NetworkPolicy::default(),
            ),
            jobs,
            run: name,
        })
    }

    /// Desired state of the infrastructure and of every Job not yet created
    pub fn configure(&mut self, run: &WorkflowRun) -> Result<()> {
        run.spec.validate()?;
        let owner = Owner::of(run)?;
        self.anchor.depend_on(&self.ctx.manager, &owner)?;

        let labels = run_labels(&self.run);
        let spec = BTreeMap::from([
            (
                WORKFLOW_KEY.to_string(),
                serde_json::to_string(&run.spec.workflow)?,
            ),
            (
                PARAMETERS_KEY.to_string(),
                serde_json::to_string(&run.spec.parameters)?,
            ),
        ]);
        self.access.configure(&labels, spec);

        apply_labels(self.steps_service_account.meta_mut(), &labels);
        self.steps_service_account.get_mut().automount_service_account_token = Some(false);

        let mut policy_labels = labels.clone();
        policy_labels.insert(LABEL_NETWORK_POLICY.to_string(), "workload".to_string());
        apply_labels(self.network_policy.meta_mut(), &policy_labels);
        self.network_policy.get_mut().spec = Some(network::workload_policy(
            &BTreeMap::from([(LABEL_RUN.to_string(), self.run.clone())]),
            &self.ctx.system_namespace,
        )?);

        for step in &run.spec.workflow.steps {
            if let Some(job) = self.jobs.get_mut(&step.name) {
                if !job.exists() {
                    configure_job(
                        job,
                        &self.ctx,
                        &self.run,
                        step,
                        &labels,
                        &self.steps_service_account,
                    );
                }
            }
        }
        Ok(())
    }

    /// Create the Jobs of steps that have none yet, each with a freshly
    /// issued token. Infrastructure must already be persisted.
    pub async fn apply_workloads(
        &mut self,
        store: &dyn ObjectStore,
        run: &WorkflowRun,
        issuer: &dyn Issuer,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let token = self.access.metadata_api.wait_for_token(store).await?;
        let namespace_uid = self.namespace.meta().uid.clone().ok_or_else(|| {
            Error::internal_with_context(
                "run",
                format!("namespace {} was not loaded", self.namespace.key()),
            )
        })?;
        let inputs = self
            .access
            .token_inputs(&self.ctx, &namespace_uid, token)
            .with_owner_ids(&run.metadata);
        let namespace = self.namespace.key().name.clone();

        for (step, job) in self.jobs.iter_mut() {
            if job.exists() {
                continue;
            }
            let identity = WorkloadIdentity::Step {
                namespace: namespace.clone(),
                run: self.run.clone(),
                step: step.clone(),
            };
            let template = job
                .get_mut()
                .spec
                .as_mut()
                .map(|spec| spec.template.metadata.get_or_insert_with(ObjectMeta::default))
                .ok_or_else(|| {
                    Error::internal_with_context("run", format!("job for step {step} not configured"))
                })?;
            if annotate_token(template, &inputs, &identity, issuer, now)? {
                debug!(run = %self.run, step = %step, "Issued step token");
            }
            self.anchor.own_child(job)?;
            job.persist(store).await?;
        }
        info!(run = %self.run, namespace = %namespace, "Applied workflow run dependencies");
        Ok(())
    }

    /// Status after a successful apply
    pub fn status(&self, run: &WorkflowRun) -> WorkflowRunStatus {
        let mut conditions = run
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        set_condition(
            &mut conditions,
            Condition::ready("DependenciesApplied", "Every step has a Job"),
        );
        let steps = self
            .jobs
            .iter()
            .map(|(step, job)| {
                let template = job.get().spec.as_ref().and_then(|s| s.template.metadata.as_ref());
                (
                    step.clone(),
                    StepStatus {
                        job: job.key().name.clone(),
                        token_subject: token_subject(template),
                    },
                )
            })
            .collect();
        WorkflowRunStatus {
            observed_generation: run.metadata.generation,
            namespace: Some(self.namespace.key().name.clone()),
            steps,
            conditions,
        }
    }
}

fn configure_job(
    job: &mut Handle<Job>,
    ctx: &DepsContext,
    run: &str,
    step: &StepSpec,
    labels: &BTreeMap<String, String>,
    service_account: &Handle<ServiceAccount>,
) {
    let mut pod_labels = labels.clone();
    pod_labels.insert(LABEL_STEP.to_string(), step.name.clone());
    apply_labels(job.meta_mut(), &pod_labels);

    let container = WorkloadContainer {
        name: &step.name,
        image: &step.image,
        input: &step.input,
        command: &step.command,
        args: &step.args,
        env: &step.env,
    }
    .build(ctx);

    job.get_mut().spec = Some(JobSpec {
        backoff_limit: Some(0),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(pod_labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                service_account_name: Some(service_account.key().name.clone()),
                automount_service_account_token: Some(false),
                restart_policy: Some("Never".to_string()),
                containers: vec![container],
                ..Default::default()
            }),
        },
        ..Default::default()
    });
    debug!(run = %run, step = %step.name, job = %job.key(), "Configured step job");
}

#[async_trait]
impl Loader for RunDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        let mut loaders = Loaders::new()
            .required(&mut self.anchor)
            .required(&mut self.namespace)
            .required(&mut self.access)
            .required(&mut self.steps_service_account)
            .required(&mut self.network_policy);
        for job in self.jobs.values_mut() {
            loaders = loaders.optional(job);
        }
        loaders.load(store).await
    }
}

/// Persists the infrastructure; Jobs follow in [`RunDeps::apply_workloads`]
#[async_trait]
impl Persister for RunDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.anchor.persist(store).await?;
        self.anchor.own_child(&mut self.access)?;
        self.anchor.own_child(&mut self.steps_service_account)?;
        self.anchor.own_child(&mut self.network_policy)?;

        Persisters::new()
            .add(&mut self.access)
            .add(&mut self.steps_service_account)
            .add(&mut self.network_policy)
            .persist(store)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use weft_common::crd::{WorkflowRunSpec, WorkflowSpec};
    use weft_common::ANNOTATION_TOKEN;
    use weft_converge::memory::MemoryStore;
    use weft_converge::WaiterConfig;
    use weft_identity::signing_key::generate_signing_key;
    use weft_identity::{decode_claims_unverified, Es256Issuer};

    use crate::manager::DependencyManager;

    fn step(name: &str) -> StepSpec {
        StepSpec {
            name: name.to_string(),
            image: "alpine:3".to_string(),
            command: vec!["make".to_string()],
            ..Default::default()
        }
    }

    fn seed(store: &MemoryStore) -> WorkflowRun {
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
                    name: Some("ci".to_string()),
                    steps: vec![step("build"), step("test")],
                },
                parameters: BTreeMap::new(),
            },
        );
        run.metadata.namespace = Some("tenant-a".to_string());
        store.insert(&run)
    }

    fn ctx() -> DepsContext {
        let mut ctx = DepsContext::new(Arc::new(DependencyManager::new()));
        ctx.waiter = WaiterConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
        };
        ctx
    }

    async fn apply(store: &MemoryStore, run: &WorkflowRun, issuer: &Es256Issuer) -> RunDeps {
        let mut deps = RunDeps::new(&ctx(), run).unwrap();
        deps.load(store).await.unwrap();
        deps.configure(run).unwrap();
        deps.persist(store).await.unwrap();
        deps.apply_workloads(store, run, issuer, Utc::now()).await.unwrap();
        deps
    }

    fn issuer() -> Es256Issuer {
        Es256Issuer::from_pkcs8(&generate_signing_key().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn jobs_carry_step_claims() {
        let store = MemoryStore::new().with_token_controller();
        let run = seed(&store);
        apply(&store, &run, &issuer()).await;

        let job: Job = store
            .get_typed(&ObjectKey::namespaced("tenant-a", naming::step_job("run-42", "build")))
            .unwrap();
        let annotations = job.spec.unwrap().template.metadata.unwrap().annotations.unwrap();
        let claims = decode_claims_unverified(&annotations[ANNOTATION_TOKEN]).unwrap();
        assert_eq!(claims.run_id.as_deref(), Some("run-42"));
        assert_eq!(claims.name, "build");
        assert!(claims.sub.starts_with("steps/"));
        assert_eq!(claims.exp, Some(claims.iat + 24 * 3600));
        assert_eq!(claims.kubernetes.immutable_config_map_name, "run-42-run-immutable");
    }

    #[tokio::test]
    async fn anchor_is_written_first_and_jobs_last() {
        let store = MemoryStore::new().with_token_controller();
        let run = seed(&store);
        apply(&store, &run, &issuer()).await;

        let ops = store.ops();
        assert_eq!(ops.first().unwrap().key.name, "run-42-run-anchor");
        let first_job = ops.iter().position(|op| op.kind == "Job").unwrap();
        assert!(ops[first_job..].iter().all(|op| op.kind == "Job"));
    }

    #[tokio::test]
    async fn second_apply_keeps_tokens_and_changes_nothing() {
        let store = MemoryStore::new().with_token_controller();
        let run = seed(&store);
        let issuer = issuer();
        let first = apply(&store, &run, &issuer).await.status(&run);
        store.clear_ops();

        let second = apply(&store, &run, &issuer).await.status(&run);
        assert!(store.changes().is_empty(), "{:?}", store.changes());
        assert_eq!(first.steps, second.steps);
        assert!(second.steps["test"].token_subject.is_some());
    }

    #[tokio::test]
    async fn fresh_load_is_ready_after_one_apply() {
        let store = MemoryStore::new().with_token_controller();
        let run = seed(&store);
        apply(&store, &run, &issuer()).await;

        let mut fresh = RunDeps::new(&ctx(), &run).unwrap();
        assert!(fresh.load(&store).await.unwrap());
    }

    #[tokio::test]
    async fn unpopulated_token_times_out_before_any_job() {
        let store = MemoryStore::new();
        let run = seed(&store);
        let mut deps = RunDeps::new(&ctx(), &run).unwrap();
        deps.load(&store).await.unwrap();
        deps.configure(&run).unwrap();
        deps.persist(&store).await.unwrap();

        let err = deps
            .apply_workloads(&store, &run, &issuer(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTokenSecret { .. }));
        assert!(store.list_typed::<Job>().is_empty());
    }

    #[tokio::test]
    async fn invalid_workflow_is_rejected_before_any_write() {
        let store = MemoryStore::new();
        let mut run = seed(&store);
        run.spec.workflow.steps.push(step("build"));
        let mut deps = RunDeps::new(&ctx(), &run).unwrap();
        deps.load(&store).await.unwrap();
        assert!(matches!(deps.configure(&run), Err(Error::Validation { .. })));
        assert!(store.ops().is_empty());
    }
}
