//! Project level configuration.

use crate::{
    cachekey,
    error::{BstError, Result},
    remote::RemoteSpec,
    utils,
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// The project configuration file name.
pub const PROJECT_CONF: &str = "project.conf";

/// The newest project format this core understands.
pub const FORMAT_VERSION: u32 = 12;

/// Warning tokens a project may promote to errors via `fatal-warnings`.
pub mod warnings {
    /// Staged files overlap between dependencies.
    pub const OVERLAPS: &str = "overlaps";
    /// Files would replace a non empty directory and were dropped.
    pub const IGNORED_FILES: &str = "ignored-files";
}

#[derive(Clone, Debug, Deserialize)]
struct ProjectDecl {
    name: String,
    #[serde(default, rename = "format-version")]
    format_version: u32,
    #[serde(default = "default_element_path", rename = "element-path")]
    element_path: String,
    #[serde(default, rename = "fatal-warnings")]
    fatal_warnings: Vec<String>,
    #[serde(default)]
    options: BTreeMap<String, String>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default, rename = "environment-nocache")]
    environment_nocache: Vec<String>,
    #[serde(default)]
    artifacts: Vec<RemoteSpec>,
    #[serde(default, rename = "split-rules")]
    split_rules: BTreeMap<String, Vec<String>>,
}

fn default_element_path() -> String {
    ".".to_string()
}

/// Workspaces open against this project: element name to host directory.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Workspaces {
    #[serde(default)]
    pub workspaces: BTreeMap<String, PathBuf>,
}

/// A loaded project.
#[derive(Clone, Debug)]
pub struct Project {
    pub name: String,
    pub directory: PathBuf,
    pub element_path: String,
    pub format_version: u32,
    pub fatal_warnings: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub variables: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub environment_nocache: Vec<String>,
    pub artifacts: Vec<RemoteSpec>,
    pub split_rules: BTreeMap<String, Vec<String>>,
    pub workspaces: BTreeMap<String, PathBuf>,
}

impl Project {
    /// Loads `project.conf` below `directory`, applying user supplied option
    /// overrides.
    pub fn load(directory: &Path, option_overrides: &BTreeMap<String, String>) -> Result<Self> {
        let conf = directory.join(PROJECT_CONF);
        if !conf.is_file() {
            return Err(BstError::load(format!(
                "{} does not describe a project (missing {PROJECT_CONF})",
                directory.display()
            ))
            .with_reason("missing-project-conf"));
        }
        let decl: ProjectDecl = utils::read_yaml_file(&conf)?;

        if decl.format_version > FORMAT_VERSION {
            return Err(BstError::load(format!(
                "project {} requires format version {}, but only {} is supported",
                decl.name, decl.format_version, FORMAT_VERSION
            ))
            .with_reason("unsupported-format-version"));
        }

        let mut options = decl.options;
        for (key, value) in option_overrides {
            options.insert(key.clone(), value.clone());
        }

        let workspaces_file = directory.join(".bst/workspaces.yml");
        let workspaces = if workspaces_file.is_file() {
            let loaded: Workspaces = utils::read_yaml_file(&workspaces_file)?;
            loaded.workspaces
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            name: decl.name,
            directory: directory.to_path_buf(),
            element_path: decl.element_path,
            format_version: decl.format_version,
            fatal_warnings: decl.fatal_warnings,
            options,
            variables: decl.variables,
            environment: decl.environment,
            environment_nocache: decl.environment_nocache,
            artifacts: decl.artifacts,
            split_rules: decl.split_rules,
            workspaces,
        })
    }

    /// Whether `token` is promoted to an error by this project.
    pub fn is_fatal_warning(&self, token: &str) -> bool {
        self.fatal_warnings.iter().any(|w| w == token)
    }

    /// The directory element files are resolved against.
    pub fn element_dir(&self) -> PathBuf {
        self.directory.join(&self.element_path)
    }

    /// The project's contribution to every element cache key.
    pub fn cache_key(&self) -> String {
        cachekey::generate_key(&serde_json::json!({
            "name": self.name,
            "format-version": self.format_version,
            "options": self.options,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn write_project(dir: &Path, conf: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(PROJECT_CONF), conf).unwrap();
    }

    #[test]
    fn loads_a_minimal_project() {
        let tmp = tempfile::tempdir().unwrap();
        write_project(tmp.path(), "name: demo\n");
        let project = Project::load(tmp.path(), &BTreeMap::new()).unwrap();
        assert_eq!(project.name, "demo");
        assert_eq!(project.element_path, ".");
        assert!(!project.is_fatal_warning(warnings::OVERLAPS));
    }

    #[test]
    fn fatal_warnings_are_respected() {
        let tmp = tempfile::tempdir().unwrap();
        write_project(tmp.path(), "name: demo\nfatal-warnings:\n- overlaps\n");
        let project = Project::load(tmp.path(), &BTreeMap::new()).unwrap();
        assert!(project.is_fatal_warning(warnings::OVERLAPS));
    }

    #[test]
    fn future_format_versions_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_project(tmp.path(), &format!("name: demo\nformat-version: {}\n", FORMAT_VERSION + 1));
        let err = Project::load(tmp.path(), &BTreeMap::new()).unwrap_err();
        assert_eq!(err.reason(), Some("unsupported-format-version"));
    }

    #[test]
    fn missing_project_conf_is_a_load_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Project::load(tmp.path(), &BTreeMap::new()).unwrap_err();
        assert_eq!(err.reason(), Some("missing-project-conf"));
    }

    #[test]
    fn option_overrides_change_the_cache_key() {
        let tmp = tempfile::tempdir().unwrap();
        write_project(tmp.path(), "name: demo\noptions:\n  arch: x86_64\n");
        let base = Project::load(tmp.path(), &BTreeMap::new()).unwrap();
        let mut overrides = BTreeMap::new();
        overrides.insert("arch".to_string(), "aarch64".to_string());
        let overridden = Project::load(tmp.path(), &overrides).unwrap();
        assert_ne!(base.cache_key(), overridden.cache_key());
    }
}
