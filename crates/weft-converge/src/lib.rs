//! Declarative resource convergence for the Weft control plane
//!
//! Layers, bottom up:
//! - [`store`]: the object-safe seam over the cluster API
//! - [`ops`]: idempotent create / update / get / delete primitives
//! - [`ownership`]: controller references and DependencyOf records
//! - [`handle`]: typed handles with Load / Persist / Own capabilities
//! - [`loaders`] and [`persisters`]: ordered composites of handles
//! - [`waiter`]: bounded waits on asynchronously populated secrets

#![warn(missing_docs)]

pub mod handle;
pub mod key;
pub mod kinds;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod loaders;
pub mod ops;
pub mod ownership;
pub mod persisters;
pub mod store;
pub mod waiter;

pub use handle::{Handle, Loader, Ownable, PersistMode, Persister};
pub use key::ObjectKey;
pub use kinds::ManagedKind;
pub use loaders::Loaders;
pub use ownership::{DependencyOf, Owner};
pub use persisters::Persisters;
pub use store::{KubeStore, ObjectStore};
pub use waiter::{ServiceAccountTokenHandle, WaiterConfig};
