//! Kubernetes Event recording for Weft controllers.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the
//! reconcile that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about reconciled objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one Event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the Event's reporting component
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// Every dependency of the object converged
    pub const DEPENDENCIES_APPLIED: &str = "DependenciesApplied";
    /// Applying dependencies failed
    pub const APPLY_FAILED: &str = "ApplyFailed";
    /// A secret referenced by an object spec does not exist
    pub const SECRET_MISSING: &str = "SecretMissing";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A workload identity token was issued
    pub const TOKEN_ISSUED: &str = "TokenIssued";
    /// Cluster-scoped or shared dependencies were cleaned up
    pub const DEPENDENCIES_DELETED: &str = "DependenciesDeleted";
    /// A shared namespace was left in place on delete
    pub const NAMESPACE_RETAINED: &str = "NamespaceRetained";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Finalizer cleanup
    pub const DELETE: &str = "Delete";
    /// Workload identity issuance
    pub const ISSUE: &str = "Issue";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<KubeEventPublisher>();
    }

    #[tokio::test]
    async fn noop_publisher_accepts_events() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::SECRET_MISSING,
                actions::RECONCILE,
                Some("vault-token".to_string()),
            )
            .await;
    }
}
