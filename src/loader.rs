//! Loading element declarations into the element arena.

use crate::{
    element::{Element, ElementState, PublicData},
    error::{BstError, Result},
    plugins::PluginRegistry,
    project::Project,
    source::{Source, SourcePlugin},
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::PathBuf,
};

/// Matches a `%{variable}` reference.
static RE_VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%\{([a-zA-Z0-9_-]+)\}").expect("static regex is valid"));

/// How many expansion passes a variable table gets before a remaining
/// reference is declared circular.
const MAX_VARIABLE_DEPTH: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DependencyType {
    Build,
    Runtime,
    All,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependencyDecl {
    Simple(String),
    Full {
        filename: String,
        #[serde(default, rename = "type")]
        dep_type: Option<DependencyType>,
    },
}

impl DependencyDecl {
    fn filename(&self) -> &str {
        match self {
            DependencyDecl::Simple(filename) => filename,
            DependencyDecl::Full { filename, .. } => filename,
        }
    }

    fn dep_type(&self) -> &DependencyType {
        match self {
            DependencyDecl::Simple(_) => &DependencyType::All,
            DependencyDecl::Full { dep_type, .. } => dep_type.as_ref().unwrap_or(&DependencyType::All),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SourceDecl {
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ElementDecl {
    kind: String,
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
    #[serde(default)]
    depends: Vec<DependencyDecl>,
    #[serde(default)]
    sources: Vec<serde_yaml::Value>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default, rename = "environment-nocache")]
    environment_nocache: Vec<String>,
    #[serde(default)]
    config: serde_yaml::Value,
    #[serde(default)]
    public: PublicData,
}

/// Loads element files into an arena, resolving dependencies transitively.
#[derive(Debug)]
pub struct Loader<'a> {
    project: &'a Project,
    project_index: usize,
    registry: &'a PluginRegistry,
}

impl<'a> Loader<'a> {
    pub fn new(project: &'a Project, project_index: usize, registry: &'a PluginRegistry) -> Self {
        Self { project, project_index, registry }
    }

    /// Loads the given target elements and their transitive dependencies.
    ///
    /// Returns the arena plus the indices of the targets within it;
    /// dependencies always precede their dependents in the arena.
    pub fn load(&self, targets: &[String]) -> Result<(Vec<Element>, Vec<usize>)> {
        let mut elements = Vec::new();
        let mut by_name = BTreeMap::new();
        let mut stack = Vec::new();
        let mut target_indices = Vec::with_capacity(targets.len());
        for target in targets {
            target_indices.push(self.load_one(target, &mut elements, &mut by_name, &mut stack)?);
        }
        Ok((elements, target_indices))
    }

    fn load_one(
        &self,
        name: &str,
        elements: &mut Vec<Element>,
        by_name: &mut BTreeMap<String, usize>,
        stack: &mut Vec<String>,
    ) -> Result<usize> {
        if let Some(&index) = by_name.get(name) {
            return Ok(index);
        }
        if stack.iter().any(|loading| loading == name) {
            let mut chain: Vec<&str> = stack.iter().map(String::as_str).collect();
            chain.push(name);
            return Err(BstError::load(format!(
                "circular dependency detected: {}",
                chain.join(" -> ")
            ))
            .with_reason("circular-dependency"));
        }
        stack.push(name.to_string());

        let path = self.element_path(name);
        if !path.is_file() {
            stack.pop();
            return Err(BstError::load(format!(
                "element {name} not found at {}",
                path.display()
            ))
            .with_reason("missing-element"));
        }
        let decl: ElementDecl = utils::read_yaml_file(&path)
            .map_err(|err| match err {
                BstError::SerdeYaml(inner) => {
                    BstError::load(format!("failed to parse element {name}: {inner}"))
                        .with_reason("invalid-yaml")
                }
                other => other,
            })?;

        let mut build_deps = Vec::new();
        let mut runtime_deps = Vec::new();
        for dep in &decl.depends {
            let index = self.load_one(dep.filename(), elements, by_name, stack)?;
            match dep.dep_type() {
                DependencyType::Build => build_deps.push(index),
                DependencyType::Runtime => runtime_deps.push(index),
                DependencyType::All => {
                    build_deps.push(index);
                    runtime_deps.push(index);
                }
            }
        }
        stack.pop();

        let variables = self.resolve_variables(name, &decl.variables)?;

        let mut environment = self.project.environment.clone();
        environment.extend(decl.environment.clone());
        let environment = environment
            .into_iter()
            .map(|(key, value)| Ok((key, substitute(name, &value, &variables)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let mut environment_nocache = self.project.environment_nocache.clone();
        environment_nocache.extend(decl.environment_nocache.clone());

        let config = substitute_value(name, &decl.config, &variables)?;
        let public = self.resolve_public(name, &decl.public, &variables)?;

        let mut split_rules = self.project.split_rules.clone();
        for (domain, globs) in &public.bst.split_rules {
            split_rules.insert(domain.clone(), globs.clone());
        }

        let plugin = self.registry.element(&decl.kind, &config)?;
        plugin.preflight()?;

        let sources = if let Some(workspace) = self.project.workspaces.get(name) {
            let plugin = std::sync::Arc::new(
                crate::plugins::sources::WorkspaceSource::new(workspace.clone()),
            );
            plugin.preflight()?;
            vec![Source::new(plugin)]
        } else {
            let mut sources = Vec::with_capacity(decl.sources.len());
            for node in &decl.sources {
                let node = substitute_value(name, node, &variables)?;
                let head: SourceDecl = serde_yaml::from_value(node.clone()).map_err(|err| {
                    BstError::load(format!("invalid source in element {name}: {err}"))
                })?;
                let plugin = self.registry.source(&head.kind, &self.project.directory, &node)?;
                plugin.preflight()?;
                sources.push(Source::new(plugin));
            }
            sources
        };

        let element = Element {
            name: name.to_string(),
            normal_name: utils::normal_name(name),
            kind: decl.kind,
            project: self.project_index,
            plugin,
            sources,
            build_deps,
            runtime_deps,
            environment,
            environment_nocache,
            variables,
            public,
            split_rules,
            state: ElementState::default(),
        };
        let index = elements.len();
        elements.push(element);
        by_name.insert(name.to_string(), index);
        debug!(element = name, index, "loaded element");
        Ok(index)
    }

    fn element_path(&self, name: &str) -> PathBuf {
        self.project.element_dir().join(name)
    }

    /// Builds the fully expanded variable table for one element.
    fn resolve_variables(
        &self,
        element: &str,
        element_vars: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut variables = default_variables(&self.project.name, element);
        variables.extend(self.project.variables.clone());
        variables.extend(element_vars.clone());

        for _ in 0..MAX_VARIABLE_DEPTH {
            let mut changed = false;
            let snapshot = variables.clone();
            for value in variables.values_mut() {
                let expanded = expand_once(value, &snapshot);
                if &expanded != value {
                    *value = expanded;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for (key, value) in &variables {
            if let Some(m) = RE_VARIABLE.captures(value) {
                return Err(BstError::load(format!(
                    "variable %{{{key}}} in element {element} references unresolved %{{{}}}",
                    &m[1]
                ))
                .with_reason("unresolved-variable"));
            }
        }
        Ok(variables)
    }

    fn resolve_public(
        &self,
        element: &str,
        public: &PublicData,
        variables: &BTreeMap<String, String>,
    ) -> Result<PublicData> {
        let mut resolved = public.clone();
        for command in &mut resolved.bst.integration_commands {
            *command = substitute(element, command, variables)?;
        }
        for glob in &mut resolved.bst.overlap_whitelist {
            *glob = substitute(element, glob, variables)?;
        }
        for globs in resolved.bst.split_rules.values_mut() {
            for glob in globs {
                *glob = substitute(element, glob, variables)?;
            }
        }
        Ok(resolved)
    }
}

/// The variables every element starts from.
fn default_variables(project_name: &str, element_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("project-name".to_string(), project_name.to_string()),
        ("element-name".to_string(), element_name.to_string()),
        ("build-root".to_string(), "/buildstream/build".to_string()),
        ("install-root".to_string(), "/buildstream/install".to_string()),
    ])
}

fn expand_once(value: &str, variables: &BTreeMap<String, String>) -> String {
    RE_VARIABLE
        .replace_all(value, |caps: &regex::Captures<'_>| {
            variables.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Substitutes `%{variable}` references in a string, failing on unknown
/// variables.
fn substitute(element: &str, value: &str, variables: &BTreeMap<String, String>) -> Result<String> {
    let mut missing = None;
    let result = RE_VARIABLE
        .replace_all(value, |caps: &regex::Captures<'_>| match variables.get(&caps[1]) {
            Some(resolved) => resolved.clone(),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                caps[0].to_string()
            }
        })
        .into_owned();
    match missing {
        Some(name) => Err(BstError::load(format!(
            "element {element} references unresolved variable %{{{name}}}"
        ))
        .with_reason("unresolved-variable")),
        None => Ok(result),
    }
}

/// Substitutes variables through every string of a YAML node.
fn substitute_value(
    element: &str,
    value: &serde_yaml::Value,
    variables: &BTreeMap<String, String>,
) -> Result<serde_yaml::Value> {
    use serde_yaml::Value;
    Ok(match value {
        Value::String(s) => Value::String(substitute(element, s, variables)?),
        Value::Sequence(items) => Value::Sequence(
            items.iter().map(|item| substitute_value(element, item, variables)).collect::<Result<_>>()?,
        ),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (key, item) in map {
                out.insert(key.clone(), substitute_value(element, item, variables)?);
            }
            Value::Mapping(out)
        }
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::PROJECT_CONF;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn project_fixture(elements: &[(&str, &str)]) -> (tempfile::TempDir, Project) {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(PROJECT_CONF),
            "name: demo\nvariables:\n  prefix: /usr\n",
        )
        .unwrap();
        for (name, content) in elements {
            let path = tmp.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let project = Project::load(tmp.path(), &BTreeMap::new()).unwrap();
        (tmp, project)
    }

    #[test]
    fn loads_dependencies_before_dependents() {
        let (_tmp, project) = project_fixture(&[
            ("base.bst", "kind: stack\n"),
            ("app.bst", "kind: stack\ndepends:\n- base.bst\n"),
        ]);
        let registry = PluginRegistry::with_builtins();
        let loader = Loader::new(&project, 0, &registry);
        let (elements, targets) = loader.load(&["app.bst".to_string()]).unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].name, "base.bst");
        assert_eq!(elements[1].name, "app.bst");
        assert_eq!(targets, vec![1]);
        assert_eq!(elements[1].build_deps, vec![0]);
        assert_eq!(elements[1].runtime_deps, vec![0]);
    }

    #[test]
    fn typed_dependencies_land_in_the_right_list() {
        let (_tmp, project) = project_fixture(&[
            ("tool.bst", "kind: stack\n"),
            ("lib.bst", "kind: stack\n"),
            (
                "app.bst",
                "kind: stack\ndepends:\n- filename: tool.bst\n  type: build\n- filename: lib.bst\n  type: runtime\n",
            ),
        ]);
        let registry = PluginRegistry::with_builtins();
        let loader = Loader::new(&project, 0, &registry);
        let (elements, _) = loader.load(&["app.bst".to_string()]).unwrap();
        let app = &elements[2];
        assert_eq!(app.build_deps.len(), 1);
        assert_eq!(app.runtime_deps.len(), 1);
        assert_eq!(elements[app.build_deps[0]].name, "tool.bst");
        assert_eq!(elements[app.runtime_deps[0]].name, "lib.bst");
    }

    #[test]
    fn circular_dependencies_are_detected() {
        let (_tmp, project) = project_fixture(&[
            ("a.bst", "kind: stack\ndepends:\n- b.bst\n"),
            ("b.bst", "kind: stack\ndepends:\n- a.bst\n"),
        ]);
        let registry = PluginRegistry::with_builtins();
        let loader = Loader::new(&project, 0, &registry);
        let err = loader.load(&["a.bst".to_string()]).unwrap_err();
        assert_eq!(err.reason(), Some("circular-dependency"));
    }

    #[test]
    fn variables_substitute_into_config_and_commands() {
        let (_tmp, project) = project_fixture(&[(
            "app.bst",
            r#"kind: manual
variables:
  bindir: "%{prefix}/bin"
config:
  install-commands:
  - install tool "%{install-root}%{bindir}"
"#,
        )]);
        let registry = PluginRegistry::with_builtins();
        let loader = Loader::new(&project, 0, &registry);
        let (elements, _) = loader.load(&["app.bst".to_string()]).unwrap();
        let key = elements[0].plugin.unique_key();
        assert!(key.to_string().contains("/buildstream/install/usr/bin"));
    }

    #[test]
    fn unresolved_variables_are_load_errors() {
        let (_tmp, project) = project_fixture(&[(
            "app.bst",
            "kind: manual\nconfig:\n  build-commands:\n  - echo %{nonexistent}\n",
        )]);
        let registry = PluginRegistry::with_builtins();
        let loader = Loader::new(&project, 0, &registry);
        let err = loader.load(&["app.bst".to_string()]).unwrap_err();
        assert_eq!(err.reason(), Some("unresolved-variable"));
    }

    #[test]
    fn missing_elements_are_load_errors() {
        let (_tmp, project) = project_fixture(&[]);
        let registry = PluginRegistry::with_builtins();
        let loader = Loader::new(&project, 0, &registry);
        let err = loader.load(&["ghost.bst".to_string()]).unwrap_err();
        assert_eq!(err.reason(), Some("missing-element"));
    }
}
