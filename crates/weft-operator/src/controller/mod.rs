//! Reconcilers for the four top-level kinds
//!
//! Every reconcile runs one synchronous cycle: re-read the object, handle
//! deletion, check the secrets the object spec names, converge the
//! dependency graph, and write status only when the whole cycle succeeded. Errors go to
//! [`error_policy`], which picks the requeue delay from the error class.

pub mod platform;
pub mod run;
pub mod tenant;
pub mod trigger;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info};

use weft_common::crd::SecretRef;
use weft_common::events::{reasons, EventPublisher};
use weft_common::{Error, Result};
use weft_converge::{ops, ManagedKind, ObjectKey, ObjectStore};
use weft_deps::DepsContext;

/// Finalizer guarding cleanup that garbage collection cannot do
pub const FINALIZER: &str = "weft.dev/cleanup";

/// Requeue after a successful cycle, to repair drift
pub const REQUEUE_SUCCESS: Duration = Duration::from_secs(300);
/// Requeue after a transient error
pub const REQUEUE_TRANSIENT: Duration = Duration::from_secs(5);
/// Requeue after a retryable error
pub const REQUEUE_RETRYABLE: Duration = Duration::from_secs(30);
/// Requeue after an error that needs a spec change
pub const REQUEUE_PERMANENT: Duration = Duration::from_secs(300);

/// Shared by every reconcile of every controller
pub struct Context {
    /// Cluster access
    pub store: Arc<dyn ObjectStore>,
    /// Graph settings
    pub deps: DepsContext,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Secret holding the workload signing key
    pub signing_key: ObjectKey,
}

impl Context {
    /// Bundle the reconcile dependencies
    pub fn new(
        store: Arc<dyn ObjectStore>,
        deps: DepsContext,
        events: Arc<dyn EventPublisher>,
        signing_key: ObjectKey,
    ) -> Self {
        Self {
            store,
            deps,
            events,
            signing_key,
        }
    }

    /// Current state of `obj`, or `None` once it is gone
    pub async fn refetch<K: ManagedKind>(&self, obj: &K) -> Result<Option<K>> {
        let mut current = obj.clone();
        let found =
            ops::get_ignore_not_found(self.store.as_ref(), &ObjectKey::of(obj.meta()), &mut current)
                .await?;
        Ok(found.then_some(current))
    }

    /// Fail with [`Error::RequiredSecretMissing`] unless the referenced
    /// Secret exists
    pub async fn require_secret(&self, secret: &SecretRef, default_namespace: &str) -> Result<()> {
        let key = ObjectKey::namespaced(secret.namespace_or(default_namespace), &secret.name);
        let mut found = Secret::default();
        if ops::get_ignore_not_found(self.store.as_ref(), &key, &mut found).await? {
            return Ok(());
        }
        Err(Error::RequiredSecretMissing {
            namespace: key.namespace.unwrap_or_default(),
            name: key.name,
        })
    }

    /// Publish a Normal Event on `obj`
    pub async fn publish_normal<K>(&self, obj: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(&obj.object_ref(&()), EventType::Normal, reason, action, Some(note))
            .await;
    }

    /// Publish a Warning Event describing `err` on `obj`
    pub async fn publish_failure<K>(&self, obj: &K, action: &str, err: &Error)
    where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(
                &obj.object_ref(&()),
                EventType::Warning,
                failure_reason(err),
                action,
                Some(err.to_string()),
            )
            .await;
    }
}

/// Event reason for a failed cycle
pub fn failure_reason(err: &Error) -> &'static str {
    match err {
        Error::RequiredSecretMissing { .. } => reasons::SECRET_MISSING,
        Error::Validation { .. } => reasons::VALIDATION_FAILED,
        Error::Transient { source } => failure_reason(source),
        _ => reasons::APPLY_FAILED,
    }
}

/// Whether `obj` carries [`FINALIZER`]
pub fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add [`FINALIZER`] to `obj` if missing, returning the stored object
pub async fn add_finalizer<K: ManagedKind>(store: &dyn ObjectStore, obj: &K) -> Result<K> {
    let mut updated = obj.clone();
    if has_finalizer(obj) {
        return Ok(updated);
    }
    updated.finalizers_mut().push(FINALIZER.to_string());
    let key = ObjectKey::of(obj.meta());
    ops::create_or_update(store, &key, &mut updated).await?;
    debug!(key = %key, "Added finalizer");
    Ok(updated)
}

/// Remove [`FINALIZER`] from `obj`
pub async fn remove_finalizer<K: ManagedKind>(store: &dyn ObjectStore, obj: &K) -> Result<()> {
    if !has_finalizer(obj) {
        return Ok(());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().retain(|f| f != FINALIZER);
    let key = ObjectKey::of(obj.meta());
    ops::create_or_update(store, &key, &mut updated).await?;
    debug!(key = %key, "Removed finalizer");
    Ok(())
}

/// Merge-patch `status` onto `obj`
pub async fn patch_status<K: ManagedKind>(
    store: &dyn ObjectStore,
    obj: &K,
    status: &impl serde::Serialize,
) -> Result<()> {
    ops::patch_status::<K>(store, &ObjectKey::of(obj.meta()), status).await
}

/// Requeue delay for a failed reconcile
pub fn requeue_after(err: &Error) -> Duration {
    if err.is_transient() {
        REQUEUE_TRANSIENT
    } else if err.is_retryable() {
        REQUEUE_RETRYABLE
    } else {
        REQUEUE_PERMANENT
    }
}

/// Error policy shared by every controller
pub fn error_policy<K>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let delay = requeue_after(error);
    error!(
        ?error,
        kind = %K::kind(&()),
        namespace = ?obj.namespace(),
        name = %obj.name_any(),
        retryable = error.is_retryable(),
        requeue_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

/// Log and return the success action
fn applied<K: Resource<DynamicType = ()>>(obj: &K) -> Action {
    info!(
        kind = %K::kind(&()),
        namespace = ?obj.namespace(),
        name = %obj.name_any(),
        "Reconciled"
    );
    Action::requeue(REQUEUE_SUCCESS)
}


#[cfg(test)]
mod tests {
    use super::*;
    use weft_common::crd::{Tenant, TenantSpec};
    use weft_converge::memory::MemoryStore;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Boom".to_string(),
                code,
            }),
        }
    }

    #[test]
    fn requeue_delay_follows_the_error_class() {
        assert_eq!(requeue_after(&Error::transient(api_error(400))), REQUEUE_TRANSIENT);
        assert_eq!(requeue_after(&api_error(500)), REQUEUE_RETRYABLE);
        assert_eq!(requeue_after(&api_error(409)), REQUEUE_RETRYABLE);
        assert_eq!(requeue_after(&api_error(422)), REQUEUE_PERMANENT);
        assert_eq!(
            requeue_after(&Error::validation_for("run-42", "duplicate step")),
            REQUEUE_PERMANENT
        );
        assert_eq!(
            requeue_after(&Error::RequiredSecretMissing {
                namespace: "tenant-a".to_string(),
                name: "sink".to_string(),
            }),
            REQUEUE_RETRYABLE
        );
    }

    #[test]
    fn failure_reasons_name_the_cause() {
        let missing = Error::RequiredSecretMissing {
            namespace: "tenant-a".to_string(),
            name: "sink".to_string(),
        };
        assert_eq!(failure_reason(&missing), reasons::SECRET_MISSING);
        assert_eq!(failure_reason(&Error::transient(missing)), reasons::SECRET_MISSING);
        assert_eq!(
            failure_reason(&Error::validation("bad")),
            reasons::VALIDATION_FAILED
        );
        assert_eq!(failure_reason(&api_error(500)), reasons::APPLY_FAILED);
    }

    #[tokio::test]
    async fn finalizer_is_added_once_and_removed() {
        let store = MemoryStore::new();
        let mut tenant = Tenant::new("acme", TenantSpec::default());
        tenant.metadata.namespace = Some("customers".to_string());
        let tenant = store.insert(&tenant);

        let with = add_finalizer(&store, &tenant).await.unwrap();
        assert!(has_finalizer(&with));
        let again = add_finalizer(&store, &with).await.unwrap();
        assert_eq!(again.finalizers(), &[FINALIZER.to_string()]);
        assert_eq!(store.ops().len(), 1);

        remove_finalizer(&store, &with).await.unwrap();
        let stored: Tenant = store
            .get_typed(&ObjectKey::namespaced("customers", "acme"))
            .unwrap();
        assert!(!has_finalizer(&stored));
    }

    #[tokio::test]
    async fn missing_secret_is_reported_with_its_location() {
        let store = Arc::new(MemoryStore::new());
        let ctx = testing::context(store, Default::default());
        let err = ctx
            .require_secret(
                &SecretRef {
                    name: "sink".to_string(),
                    namespace: None,
                },
                "tenant-a",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RequiredSecretMissing { ref namespace, ref name }
                if namespace == "tenant-a" && name == "sink"
        ));
    }
}
