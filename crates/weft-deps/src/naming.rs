//! Deterministic names for every child resource
//!
//! All names go through [`dns_label`] so long owner names stay valid and
//! distinct. Names derived from a top-level object carry its kind, since a
//! run and a trigger may share a name within one namespace.

use weft_common::kube_utils::{dns_label, short_hash};

/// Kind of the top-level object a child is named after
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnerKind {
    /// `WeftCore`
    Core,
    /// `WorkflowRun`
    Run,
    /// `WebhookTrigger`
    Trigger,
    /// `Tenant`
    Tenant,
}

impl OwnerKind {
    fn segment(self) -> &'static str {
        match self {
            OwnerKind::Core => "core",
            OwnerKind::Run => "run",
            OwnerKind::Trigger => "trigger",
            OwnerKind::Tenant => "tenant",
        }
    }
}

/// Anchor ConfigMap of a graph rooted at `owner`
pub fn anchor(kind: OwnerKind, owner: &str) -> String {
    dns_label(&[owner, kind.segment(), "anchor"])
}

/// ConfigMap holding the owner's spec; written once
pub fn immutable_config_map(kind: OwnerKind, owner: &str) -> String {
    dns_label(&[owner, kind.segment(), "immutable"])
}

/// ConfigMap the metadata API writes outputs and conditions into
pub fn mutable_config_map(kind: OwnerKind, owner: &str) -> String {
    dns_label(&[owner, kind.segment(), "mutable"])
}

/// Service account whose token is delegated to the metadata API
pub fn metadata_api_service_account(kind: OwnerKind, owner: &str) -> String {
    dns_label(&[owner, kind.segment(), "metadata-api"])
}

/// Role granting the delegated identity access to the owner's ConfigMaps
pub fn metadata_api_role(kind: OwnerKind, owner: &str) -> String {
    dns_label(&[owner, kind.segment(), "metadata-api"])
}

/// Service account the step pods run as
pub fn steps_service_account(run: &str) -> String {
    dns_label(&[run, OwnerKind::Run.segment(), "steps"])
}

/// Job for one step of a run
///
/// Run and step names may both contain `-`, so the pair is hashed into the
/// name to keep `a-b`/`c` and `a`/`b-c` apart.
pub fn step_job(run: &str, step: &str) -> String {
    let pair = short_hash(&format!("{run}/{step}"));
    dns_label(&[run, step, &pair[..8]])
}

/// NetworkPolicy confining a workload's pods
pub fn workload_network_policy(kind: OwnerKind, owner: &str) -> String {
    dns_label(&[owner, kind.segment(), "egress"])
}

/// Deployment and Service of a webhook trigger
pub fn webhook(trigger: &str) -> String {
    dns_label(&[trigger, "webhook"])
}

/// Namespaced resources of a platform component
pub fn component(core: &str, component: &str) -> String {
    dns_label(&[core, component])
}

/// Cluster-scoped resources of a platform component
///
/// Includes the core's namespace since two cores in different namespaces
/// would otherwise collide.
pub fn cluster_component(namespace: &str, core: &str, component: &str) -> String {
    dns_label(&["weft", namespace, core, component])
}

/// Credential-agent configuration for one consumer
pub fn credential_agent_config(consumer: &str) -> String {
    dns_label(&[consumer, "credential-agent"])
}

/// Webhook serving certificate Secret
pub fn webhook_tls_secret(core: &str) -> String {
    dns_label(&[core, "webhook-tls"])
}

/// Default name of the signing-key Secret
pub fn signing_key_secret(core: &str) -> String {
    dns_label(&[core, "signing-key"])
}

/// Default ingress-deny NetworkPolicy of a tenant namespace
pub fn tenant_network_policy(tenant: &str) -> String {
    dns_label(&[tenant, OwnerKind::Tenant.segment(), "default-deny"])
}

/// LimitRange of a tenant namespace
pub fn tenant_limit_range(tenant: &str) -> String {
    dns_label(&[tenant, OwnerKind::Tenant.segment(), "defaults"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_carry_the_owner_kind() {
        assert_eq!(anchor(OwnerKind::Run, "run-42"), "run-42-run-anchor");
        assert_eq!(immutable_config_map(OwnerKind::Trigger, "ci"), "ci-trigger-immutable");
        assert_eq!(tenant_limit_range("acme"), "acme-tenant-defaults");
        assert_eq!(
            cluster_component("weft-system", "core", "operator"),
            "weft-weft-system-core-operator"
        );
    }

    #[test]
    fn run_and_trigger_of_the_same_name_do_not_share_children() {
        let children: [fn(OwnerKind, &str) -> String; 6] = [
            anchor,
            immutable_config_map,
            mutable_config_map,
            metadata_api_service_account,
            metadata_api_role,
            workload_network_policy,
        ];
        for child in children {
            assert_ne!(child(OwnerKind::Run, "ci"), child(OwnerKind::Trigger, "ci"));
        }
    }

    #[test]
    fn step_jobs_do_not_collide_across_runs() {
        let a = step_job("a-b", "c");
        let b = step_job("a", "b-c");
        assert_ne!(a, b);
        assert!(a.starts_with("a-b-c-"));
        assert_eq!(a, step_job("a-b", "c"));
    }

    #[test]
    fn long_names_stay_valid_and_distinct() {
        let long = "a".repeat(70);
        let a = step_job(&long, "build");
        let b = step_job(&long, "test");
        assert!(a.len() <= 63);
        assert_ne!(a, b);
    }
}
