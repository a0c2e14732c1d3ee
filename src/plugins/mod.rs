//! Built-in element and source kinds, plus the registry third party kinds
//! plug into.

use crate::{
    element::ElementPlugin,
    error::{BstError, Result},
    source::SourcePlugin,
};
use std::{collections::BTreeMap, path::Path, sync::Arc};

pub mod elements;
pub mod sources;

/// Builds a configured element plugin from its `config` node.
pub type ElementFactory = fn(config: &serde_yaml::Value) -> Result<Arc<dyn ElementPlugin>>;

/// Builds a configured source plugin from its YAML node, resolving any
/// relative paths against the project directory.
pub type SourceFactory =
    fn(project_dir: &Path, config: &serde_yaml::Value) -> Result<Arc<dyn SourcePlugin>>;

/// The kind to factory registry the loader consults.
///
/// Built-in kinds are statically linked; frontends register further kinds
/// before loading a pipeline.
#[derive(Default)]
pub struct PluginRegistry {
    elements: BTreeMap<String, ElementFactory>,
    sources: BTreeMap<String, SourceFactory>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("elements", &self.elements.keys().collect::<Vec<_>>())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    /// A registry holding every built-in kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register_element("import", elements::import_factory);
        registry.register_element("stack", elements::stack_factory);
        registry.register_element("manual", elements::manual_factory);
        registry.register_source("local", sources::local_factory);
        registry
    }

    /// Registers (or replaces) an element kind.
    pub fn register_element(&mut self, kind: &str, factory: ElementFactory) {
        self.elements.insert(kind.to_string(), factory);
    }

    /// Registers (or replaces) a source kind.
    pub fn register_source(&mut self, kind: &str, factory: SourceFactory) {
        self.sources.insert(kind.to_string(), factory);
    }

    pub fn element(&self, kind: &str, config: &serde_yaml::Value) -> Result<Arc<dyn ElementPlugin>> {
        let factory = self.elements.get(kind).ok_or_else(|| {
            BstError::plugin(format!("no element kind {kind:?} is registered"))
                .with_reason("missing-plugin")
        })?;
        factory(config)
    }

    pub fn source(
        &self,
        kind: &str,
        project_dir: &Path,
        config: &serde_yaml::Value,
    ) -> Result<Arc<dyn SourcePlugin>> {
        let factory = self.sources.get(kind).ok_or_else(|| {
            BstError::plugin(format!("no source kind {kind:?} is registered"))
                .with_reason("missing-plugin")
        })?;
        factory(project_dir, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = PluginRegistry::with_builtins();
        let config = serde_yaml::Value::Null;
        assert!(registry.element("stack", &config).is_ok());
        assert!(registry.element("manual", &config).is_ok());
        let err = registry.element("no-such-kind", &config).unwrap_err();
        assert_eq!(err.reason(), Some("missing-plugin"));
    }
}
