//! User level configuration.

use crate::{error::Result, remote::RemoteSpec, utils};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// What the scheduler does with the rest of the session when a job fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnErrorPolicy {
    /// Mark the element failed and keep building independent branches.
    Continue,
    /// Stop dispatching new jobs, let in-flight jobs finish.
    #[default]
    Quit,
    /// Stop dispatching and terminate in-flight jobs.
    Terminate,
}

/// The `cache` section of the user configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CacheConfig {
    /// Artifact cache quota in bytes; `None` means unbounded.
    #[serde(default)]
    pub quota: Option<u64>,
}

/// The `scheduler` section of the user configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub fetchers: Option<usize>,
    #[serde(default)]
    pub builders: Option<usize>,
    #[serde(default)]
    pub pushers: Option<usize>,
    #[serde(default, rename = "network-retries")]
    pub network_retries: Option<u32>,
    #[serde(default, rename = "on-error")]
    pub on_error: Option<OnErrorPolicy>,
}

/// Per project overrides inside the user configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserProjectConfig {
    #[serde(default)]
    pub artifacts: Vec<RemoteSpec>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// The user configuration file.
///
/// All fields are optional; [`crate::ContextBuilder`] fills in the defaults
/// for anything left unset.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub sourcedir: Option<PathBuf>,
    #[serde(default)]
    pub builddir: Option<PathBuf>,
    #[serde(default)]
    pub artifactdir: Option<PathBuf>,
    #[serde(default)]
    pub logdir: Option<PathBuf>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// User global remote artifact caches.
    #[serde(default)]
    pub artifacts: Vec<RemoteSpec>,
    /// Per project overrides, keyed by project name.
    #[serde(default)]
    pub projects: BTreeMap<String, UserProjectConfig>,
}

impl UserConfig {
    /// Reads the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        utils::read_yaml_file(path)
    }

    /// The remote specs the user configured for `project`, if any.
    pub fn project_artifacts(&self, project: &str) -> &[RemoteSpec] {
        self.projects.get(project).map(|p| p.artifacts.as_slice()).unwrap_or(&[])
    }

    /// The option overrides the user configured for `project`.
    pub fn project_options(&self, project: &str) -> BTreeMap<String, String> {
        self.projects.get(project).map(|p| p.options.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_config_parses() {
        let yaml = r#"
sourcedir: /var/cache/sources
builddir: /var/cache/build
cache:
  quota: 4096
scheduler:
  fetchers: 4
  builders: 2
  network-retries: 3
  on-error: continue
artifacts:
  - url: file:///srv/cache
    push: true
projects:
  demo:
    artifacts:
      - url: file:///srv/demo-cache
    options:
      arch: x86_64
"#;
        let config: UserConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cache.quota, Some(4096));
        assert_eq!(config.scheduler.builders, Some(2));
        assert_eq!(config.scheduler.on_error, Some(OnErrorPolicy::Continue));
        assert_eq!(config.artifacts.len(), 1);
        assert!(config.artifacts[0].push);
        assert_eq!(config.project_artifacts("demo").len(), 1);
        assert_eq!(config.project_options("demo").get("arch").map(String::as_str), Some("x86_64"));
        assert!(config.project_artifacts("other").is_empty());
    }

    #[test]
    fn empty_config_defaults() {
        let config: UserConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.cache.quota, None);
        assert_eq!(config.scheduler.on_error, None);
    }
}
