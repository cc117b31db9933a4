//! Dependency graphs for the Weft top-level resources
//!
//! Every top-level object (platform core, workflow run, webhook trigger,
//! tenant) is converged by one graph of child resources. A graph is driven
//! through the same cycle on every reconcile:
//!
//! 1. **Load** the live state of every child
//! 2. **Configure** desired state in place, keeping server-owned metadata
//! 3. **Persist** the anchor, make it the controller of every namespaced
//!    child, then persist the children in a fixed order
//! 4. for runs and triggers, resolve the delegated token and create the
//!    workloads with their signed identity
//!
//! The [`apply`] functions wrap that cycle for the reconcilers.

#![warn(missing_docs)]

pub mod access;
pub mod anchor;
pub mod apply;
pub mod context;
pub mod manager;
pub mod naming;
pub mod network;
pub mod platform;
pub mod pod;
pub mod run;
pub mod tenant;
pub mod trigger;

pub use anchor::DependencyAnchor;
pub use apply::{
    apply_core_deps, apply_tenant_deps, apply_webhook_trigger_deps, apply_workflow_run_deps,
    delete_core_deps, delete_tenant_deps,
};
pub use context::DepsContext;
pub use manager::DependencyManager;
pub use platform::CoreDeps;
pub use run::RunDeps;
pub use tenant::{TenantDeletion, TenantDeps};
pub use trigger::TriggerDeps;
