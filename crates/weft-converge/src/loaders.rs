//! Composite loaders
//!
//! ```ignore
//! let ready = Loaders::new()
//!     .required(&mut self.anchor)
//!     .required(&mut self.role)
//!     .optional(&mut self.legacy_secret)
//!     .load(store)
//!     .await?;
//! ```

use weft_common::Result;

use crate::handle::Loader;
use crate::store::ObjectStore;

/// Whether an entry's absence makes the aggregate not ready
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// Absence makes the aggregate not ready
    Required,
    /// Absence is ignored
    Optional,
}

/// An ordered set of loaders evaluated as one
#[derive(Default)]
pub struct Loaders<'a> {
    entries: Vec<(Requirement, &'a mut dyn Loader)>,
}

impl<'a> Loaders<'a> {
    /// Empty set (trivially ready)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry whose absence makes the set not ready
    pub fn required(mut self, loader: &'a mut dyn Loader) -> Self {
        self.entries.push((Requirement::Required, loader));
        self
    }

    /// Add an entry whose absence is tolerated
    pub fn optional(mut self, loader: &'a mut dyn Loader) -> Self {
        self.entries.push((Requirement::Optional, loader));
        self
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load every entry in order.
    ///
    /// Returns the AND of all required entries. The first error aborts the
    /// remaining loads. A required miss does not: later entries are still
    /// loaded so every handle reflects live state before `Configure` runs.
    pub async fn load(self, store: &dyn ObjectStore) -> Result<bool> {
        let mut ready = true;
        for (requirement, loader) in self.entries {
            let found = loader.load(store).await?;
            if requirement == Requirement::Required && !found {
                ready = false;
            }
        }
        Ok(ready)
    }
}
