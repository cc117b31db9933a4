//! Webhook trigger graph
//!
//! Same access pattern as a run, but the workload is a long-running
//! Deployment behind a Service. The Deployment is replaced every reconcile
//! while the token and subject annotations on its pod template are carried
//! over from the live object, so the token is issued once and never expires.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ContainerPort, Namespace, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, info};

use weft_common::crd::{set_condition, Condition, WebhookTrigger, WebhookTriggerStatus};
use weft_common::{
    Error, Result, LABEL_MANAGED_BY, LABEL_MANAGED_BY_WEFT, LABEL_NETWORK_POLICY, LABEL_TRIGGER,
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
use crate::pod::{token_annotations, WorkloadContainer};

/// Immutable ConfigMap key holding the trigger spec
pub const TRIGGER_KEY: &str = "trigger.json";

/// Every child of one [`WebhookTrigger`]
pub struct TriggerDeps {
    ctx: DepsContext,
    trigger: String,
    anchor: DependencyAnchor,
    namespace: Handle<Namespace>,
    /// ConfigMaps, delegated identity, and RBAC
    pub access: WorkloadAccess,
    /// Ingress on the webhook port; egress to the metadata API and DNS
    pub network_policy: Handle<NetworkPolicy>,
    /// The receiver
    pub deployment: Handle<Deployment>,
    /// Endpoint of the receiver
    pub service: Handle<Service>,
}

fn trigger_labels(trigger: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TRIGGER.to_string(), trigger.to_string()),
        (LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_WEFT.to_string()),
    ])
}

impl TriggerDeps {
    /// Handles for every child of `trigger`
    pub fn new(ctx: &DepsContext, trigger: &WebhookTrigger) -> Result<Self> {
        let name = trigger.name_any();
        let namespace = trigger
            .namespace()
            .ok_or_else(|| Error::validation_for(&name, "webhook trigger has no namespace"))?;
        let key = |child: String| ObjectKey::namespaced(&namespace, child);
        Ok(Self {
            ctx: ctx.clone(),
            anchor: DependencyAnchor::new(key(naming::anchor(OwnerKind::Trigger, &name))),
            namespace: Handle::new(ObjectKey::cluster(&namespace), Namespace::default()),
            access: WorkloadAccess::new(&namespace, OwnerKind::Trigger, &name, ctx.waiter),
            network_policy: Handle::new(
                key(naming::workload_network_policy(OwnerKind::Trigger, &name)),
                NetworkPolicy::default(),
            ),
            deployment: Handle::new(key(naming::webhook(&name)), Deployment::default()),
            service: Handle::new(key(naming::webhook(&name)), Service::default()),
            trigger: name,
        })
    }

    /// Desired state of every child except the token
    pub fn configure(&mut self, trigger: &WebhookTrigger) -> Result<()> {
        let owner = Owner::of(trigger)?;
        self.anchor.depend_on(&self.ctx.manager, &owner)?;

        let labels = trigger_labels(&self.trigger);
        let spec = BTreeMap::from([(TRIGGER_KEY.to_string(), serde_json::to_string(&trigger.spec)?)]);
        self.access.configure(&labels, spec);

        let port = trigger.spec.port();
        let pods = BTreeMap::from([(LABEL_TRIGGER.to_string(), self.trigger.clone())]);
        let mut policy_labels = labels.clone();
        policy_labels.insert(LABEL_NETWORK_POLICY.to_string(), "webhook".to_string());
        apply_labels(self.network_policy.meta_mut(), &policy_labels);
        self.network_policy.get_mut().spec = Some(network::webhook_policy(
            &pods,
            port,
            &self.ctx.system_namespace,
        )?);

        apply_labels(self.service.meta_mut(), &labels);
        self.service.get_mut().spec = Some(ServiceSpec {
            selector: Some(pods.clone()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        });

        self.configure_deployment(trigger, &labels, pods, port);
        Ok(())
    }

    fn configure_deployment(
        &mut self,
        trigger: &WebhookTrigger,
        labels: &BTreeMap<String, String>,
        pods: BTreeMap<String, String>,
        port: i32,
    ) {
        let carried = token_annotations(
            self.deployment
                .get()
                .spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref()),
        );

        let mut container = WorkloadContainer {
            name: "webhook",
            image: &trigger.spec.image,
            input: &trigger.spec.input,
            command: &[],
            args: &[],
            env: &trigger.spec.env,
        }
        .build(&self.ctx);
        container.ports = Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: port,
            ..Default::default()
        }]);

        let mut pod_labels = labels.clone();
        pod_labels.extend(pods.clone());
        apply_labels(self.deployment.meta_mut(), labels);
        self.deployment.get_mut().spec = Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(pods),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: (!carried.is_empty()).then_some(carried),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(self.access.metadata_api.key().name.clone()),
                    automount_service_account_token: Some(false),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        });
    }

    /// Issue the receiver's token if it has none yet, then persist the
    /// Deployment and Service. Infrastructure must already be persisted.
    pub async fn apply_workloads(
        &mut self,
        store: &dyn ObjectStore,
        trigger: &WebhookTrigger,
        issuer: &dyn Issuer,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let token = self.access.metadata_api.wait_for_token(store).await?;
        let namespace_uid = self.namespace.meta().uid.clone().ok_or_else(|| {
            Error::internal_with_context(
                "trigger",
                format!("namespace {} was not loaded", self.namespace.key()),
            )
        })?;
        let inputs = self
            .access
            .token_inputs(&self.ctx, &namespace_uid, token)
            .with_owner_ids(&trigger.metadata);
        let identity = WorkloadIdentity::Trigger {
            namespace: self.namespace.key().name.clone(),
            trigger: self.trigger.clone(),
        };

        let template = self
            .deployment
            .get_mut()
            .spec
            .as_mut()
            .map(|spec| spec.template.metadata.get_or_insert_with(ObjectMeta::default))
            .ok_or_else(|| Error::internal_with_context("trigger", "deployment not configured"))?;
        if annotate_token(template, &inputs, &identity, issuer, now)? {
            debug!(trigger = %self.trigger, "Issued trigger token");
        }

        self.anchor.own_child(&mut self.service)?;
        self.anchor.own_child(&mut self.deployment)?;
        Persisters::new()
            .add(&mut self.service)
            .add(&mut self.deployment)
            .persist(store)
            .await?;
        info!(trigger = %self.trigger, "Applied webhook trigger dependencies");
        Ok(())
    }

    /// In-cluster URL of the receiver
    pub fn url(&self) -> Option<String> {
        let port = self.service.get().spec.as_ref()?.ports.as_ref()?.first()?.port;
        let namespace = self.service.key().namespace.as_deref()?;
        Some(format!("http://{}.{namespace}.svc:{port}", self.service.key().name))
    }

    /// Status after a successful apply
    pub fn status(&self, trigger: &WebhookTrigger) -> WebhookTriggerStatus {
        let mut conditions = trigger
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        set_condition(
            &mut conditions,
            Condition::ready("DependenciesApplied", "Webhook receiver applied"),
        );
        WebhookTriggerStatus {
            observed_generation: trigger.metadata.generation,
            namespace: Some(self.namespace.key().name.clone()),
            url: self.url(),
            conditions,
        }
    }
}

#[async_trait]
impl Loader for TriggerDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        Loaders::new()
            .required(&mut self.anchor)
            .required(&mut self.namespace)
            .required(&mut self.access)
            .required(&mut self.network_policy)
            .required(&mut self.deployment)
            .required(&mut self.service)
            .load(store)
            .await
    }
}

/// Persists the infrastructure; the receiver follows in
/// [`TriggerDeps::apply_workloads`]
#[async_trait]
impl Persister for TriggerDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.anchor.persist(store).await?;
        self.anchor.own_child(&mut self.access)?;
        self.anchor.own_child(&mut self.network_policy)?;

        Persisters::new()
            .add(&mut self.access)
            .add(&mut self.network_policy)
            .persist(store)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use weft_common::crd::WebhookTriggerSpec;
    use weft_common::{ANNOTATION_TOKEN, ANNOTATION_TOKEN_SUBJECT};
    use weft_converge::memory::MemoryStore;
    use weft_identity::signing_key::generate_signing_key;
    use weft_identity::{decode_claims_unverified, Es256Issuer};

    use crate::manager::DependencyManager;

    fn seed(store: &MemoryStore) -> WebhookTrigger {
        store.insert(&Namespace {
            metadata: ObjectMeta {
                name: Some("tenant-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut trigger = WebhookTrigger::new(
            "github",
            WebhookTriggerSpec {
                image: "weft/webhook:1".to_string(),
                ..Default::default()
            },
        );
        trigger.metadata.namespace = Some("tenant-a".to_string());
        store.insert(&trigger)
    }

    async fn apply(store: &MemoryStore, trigger: &WebhookTrigger, issuer: &Es256Issuer) -> TriggerDeps {
        let ctx = DepsContext::new(Arc::new(DependencyManager::new()));
        let mut deps = TriggerDeps::new(&ctx, trigger).unwrap();
        deps.load(store).await.unwrap();
        deps.configure(trigger).unwrap();
        deps.persist(store).await.unwrap();
        deps.apply_workloads(store, trigger, issuer, Utc::now()).await.unwrap();
        deps
    }

    fn template_annotations(store: &MemoryStore) -> BTreeMap<String, String> {
        let deployment: Deployment = store
            .get_typed(&ObjectKey::namespaced("tenant-a", "github-webhook"))
            .unwrap();
        deployment.spec.unwrap().template.metadata.unwrap().annotations.unwrap()
    }

    #[tokio::test]
    async fn receiver_token_never_expires() {
        let store = MemoryStore::new().with_token_controller();
        let trigger = seed(&store);
        let issuer = Es256Issuer::from_pkcs8(&generate_signing_key().unwrap()).unwrap();
        let deps = apply(&store, &trigger, &issuer).await;

        let claims = decode_claims_unverified(&template_annotations(&store)[ANNOTATION_TOKEN]).unwrap();
        assert!(claims.sub.starts_with("triggers/"));
        assert_eq!(claims.exp, None);
        assert_eq!(claims.run_id, None);
        assert_eq!(
            deps.status(&trigger).url.as_deref(),
            Some("http://github-webhook.tenant-a.svc:8443")
        );
    }

    #[tokio::test]
    async fn token_survives_the_next_reconcile() {
        let store = MemoryStore::new().with_token_controller();
        let trigger = seed(&store);
        let issuer = Es256Issuer::from_pkcs8(&generate_signing_key().unwrap()).unwrap();
        apply(&store, &trigger, &issuer).await;
        let first = template_annotations(&store);
        store.clear_ops();

        apply(&store, &trigger, &issuer).await;
        assert_eq!(template_annotations(&store), first);
        assert!(first.contains_key(ANNOTATION_TOKEN_SUBJECT));
        assert!(store.changes().is_empty(), "{:?}", store.changes());
    }

    #[tokio::test]
    async fn fresh_load_is_ready_after_one_apply() {
        let store = MemoryStore::new().with_token_controller();
        let trigger = seed(&store);
        let issuer = Es256Issuer::from_pkcs8(&generate_signing_key().unwrap()).unwrap();
        apply(&store, &trigger, &issuer).await;

        let ctx = DepsContext::new(Arc::new(DependencyManager::new()));
        let mut fresh = TriggerDeps::new(&ctx, &trigger).unwrap();
        assert!(fresh.load(&store).await.unwrap());
    }

    #[tokio::test]
    async fn image_change_keeps_the_token() {
        let store = MemoryStore::new().with_token_controller();
        let mut trigger = seed(&store);
        let issuer = Es256Issuer::from_pkcs8(&generate_signing_key().unwrap()).unwrap();
        apply(&store, &trigger, &issuer).await;
        let first = template_annotations(&store);

        trigger.spec.image = "weft/webhook:2".to_string();
        apply(&store, &trigger, &issuer).await;
        assert_eq!(template_annotations(&store)[ANNOTATION_TOKEN], first[ANNOTATION_TOKEN]);
    }
}
