//! The source plugin contract.

use crate::error::Result;
use serde_json::Value;
use std::{fmt, path::Path, sync::Arc};

/// How far along a source is towards being usable for a build.
///
/// An element's consistency is the minimum over its sources; building
/// requires [`Consistency::Cached`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Consistency {
    /// No concrete ref is pinned yet; tracking is required first.
    Inconsistent,
    /// A concrete ref is pinned but the content is not locally present.
    Resolved,
    /// The pinned content is locally present and stageable.
    Cached,
}

/// The contract concrete source transports implement.
///
/// Implementations are configured at construction time from their YAML
/// node; the trait only covers the operations the pipeline drives. All
/// methods take `&self` so a plugin can be shared with worker threads;
/// mutable internals (the pinned ref) are the implementation's concern.
pub trait SourcePlugin: Send + Sync + fmt::Debug {
    /// The plugin kind identifier, e.g. `"local"`.
    fn kind(&self) -> &str;

    /// Asserts host side requirements (tools, reachable paths) early.
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// This source's contribution to the element cache key.
    ///
    /// Returns `None` while the information is incomplete (no ref pinned
    /// yet), which in turn keeps the element's cache keys unknown.
    fn unique_key(&self) -> Result<Option<Value>>;

    /// The source's current consistency.
    fn consistency(&self) -> Result<Consistency>;

    /// The currently pinned ref, if any.
    fn get_ref(&self) -> Option<String>;

    /// Pins a new ref, as produced by [`SourcePlugin::track`].
    fn set_ref(&self, new_ref: &str) -> Result<()>;

    /// Whether this source kind can resolve symbolic refs at all.
    fn is_trackable(&self) -> bool {
        false
    }

    /// Resolves the symbolic tracking target to a concrete ref.
    ///
    /// Returns `None` when there is nothing to track.
    fn track(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Ensures the pinned ref's content is locally present.
    fn fetch(&self) -> Result<()> {
        Ok(())
    }

    /// Materializes the pinned content below `directory`, exactly as
    /// pinned.
    fn stage(&self, directory: &Path) -> Result<()>;

    /// Whether cache keys derived from this source are stable.
    ///
    /// Open workspaces return `false` until the element has been (re)built,
    /// which invalidates all derived keys in the meantime.
    fn is_stable(&self) -> bool {
        true
    }

    /// Whether this source is an open workspace.
    fn is_workspace(&self) -> bool {
        false
    }

    /// Invoked after a successful build of the owning element.
    fn mark_built(&self) {}
}

/// A source attached to an element, carrying the session's cached
/// consistency state next to the shared plugin.
#[derive(Clone, Debug)]
pub struct Source {
    pub plugin: Arc<dyn SourcePlugin>,
    pub consistency: Consistency,
}

impl Source {
    pub fn new(plugin: Arc<dyn SourcePlugin>) -> Self {
        Self { plugin, consistency: Consistency::Inconsistent }
    }

    /// Re-queries the plugin for its consistency.
    pub fn update_state(&mut self) -> Result<()> {
        self.consistency = self.plugin.consistency()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_orders_from_inconsistent_to_cached() {
        assert!(Consistency::Inconsistent < Consistency::Resolved);
        assert!(Consistency::Resolved < Consistency::Cached);
        assert_eq!(
            [Consistency::Cached, Consistency::Resolved].iter().min(),
            Some(&Consistency::Resolved)
        );
    }
}
