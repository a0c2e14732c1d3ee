#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{BstError, ErrorDomain, Result};

pub mod utils;

pub mod cas;
pub use cas::{CasCache, Digest};

pub mod cachekey;

pub mod vdir;
pub use vdir::{CasDir, FsDir};

mod config;
pub use config::{OnErrorPolicy, UserConfig};

pub mod project;
pub use project::Project;

pub mod remote;
pub use remote::{CasRemote, RemoteSpec};

pub mod source;
pub use source::{Consistency, SourcePlugin};

pub mod element;
pub use element::{Element, ElementPlugin, Scope};

pub mod artifact;
pub use artifact::ArtifactCache;

pub mod sandbox;
pub use sandbox::{Sandbox, SandboxFlags};

pub mod plugins;
pub use plugins::PluginRegistry;

mod loader;

pub mod pipeline;
pub use pipeline::{Pipeline, PipelineSelection, SessionControl, SessionFailure, SessionResults};

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

/// Process-wide state consumed by every component: cache roots, quota,
/// concurrency caps, the strict-mode flag and the configured remotes.
#[derive(Clone, Debug)]
pub struct Context {
    /// Where fetched sources are mirrored.
    pub sourcedir: PathBuf,
    /// Scratch space for sandbox roots.
    pub builddir: PathBuf,
    /// Root of the artifact store (`cas/` and `extract/` live below it).
    pub artifactdir: PathBuf,
    /// Per-action log files.
    pub logdir: PathBuf,
    /// Artifact cache quota in bytes, `None` for unbounded.
    pub cache_quota: Option<u64>,
    /// Concurrency cap for track, fetch and pull jobs.
    pub fetchers: usize,
    /// Concurrency cap for build jobs.
    pub builders: usize,
    /// Concurrency cap for push jobs.
    pub pushers: usize,
    /// Retry budget for track and fetch failures.
    pub network_retries: u32,
    /// What to do with the session when a job fails.
    pub on_error: OnErrorPolicy,
    /// Whether cache queries match on strict keys only.
    pub strict: bool,
    /// Highest priority remote specs, e.g. from a command line override.
    pub remote_overrides: Vec<RemoteSpec>,
    /// The loaded user configuration.
    pub user_config: UserConfig,
    /// The plugin kinds available to the loader.
    pub registry: Arc<PluginRegistry>,
}

impl Context {
    /// Convenience function to call `ContextBuilder::default()`.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// The context's contribution to every element cache key.
    ///
    /// Deliberately excludes everything session specific (quota, caps,
    /// strictness): none of it changes what a build produces.
    pub fn cache_key(&self) -> String {
        cachekey::generate_key(&serde_json::json!({}))
    }

    /// The user configured option overrides for `project`.
    pub fn project_options(&self, project: &str) -> BTreeMap<String, String> {
        self.user_config.project_options(project)
    }
}

/// Builds a [`Context`], layering explicit settings over the user
/// configuration over built-in defaults.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    cachedir: Option<PathBuf>,
    sourcedir: Option<PathBuf>,
    builddir: Option<PathBuf>,
    artifactdir: Option<PathBuf>,
    logdir: Option<PathBuf>,
    cache_quota: Option<u64>,
    fetchers: Option<usize>,
    builders: Option<usize>,
    pushers: Option<usize>,
    network_retries: Option<u32>,
    on_error: Option<OnErrorPolicy>,
    strict: Option<bool>,
    remote_overrides: Vec<RemoteSpec>,
    user_config: Option<UserConfig>,
    registry: Option<PluginRegistry>,
}

impl ContextBuilder {
    /// Applies a loaded user configuration file.
    #[must_use]
    pub fn user_config(mut self, config: UserConfig) -> Self {
        self.user_config = Some(config);
        self
    }

    /// Places every cache directory below one root.
    #[must_use]
    pub fn cachedir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cachedir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn sourcedir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sourcedir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn builddir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.builddir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn artifactdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifactdir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn logdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logdir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn cache_quota(mut self, quota: u64) -> Self {
        self.cache_quota = Some(quota);
        self
    }

    /// Sets the concurrency cap for track, fetch and pull jobs.
    ///
    /// # Panics
    ///
    /// `fetchers` must be at least 1
    #[must_use]
    pub fn fetchers(mut self, fetchers: usize) -> Self {
        assert!(fetchers > 0);
        self.fetchers = Some(fetchers);
        self
    }

    /// Sets the concurrency cap for build jobs.
    ///
    /// # Panics
    ///
    /// `builders` must be at least 1
    #[must_use]
    pub fn builders(mut self, builders: usize) -> Self {
        assert!(builders > 0);
        self.builders = Some(builders);
        self
    }

    /// Sets the concurrency cap for push jobs.
    ///
    /// # Panics
    ///
    /// `pushers` must be at least 1
    #[must_use]
    pub fn pushers(mut self, pushers: usize) -> Self {
        assert!(pushers > 0);
        self.pushers = Some(pushers);
        self
    }

    #[must_use]
    pub fn network_retries(mut self, retries: u32) -> Self {
        self.network_retries = Some(retries);
        self
    }

    #[must_use]
    pub fn on_error(mut self, policy: OnErrorPolicy) -> Self {
        self.on_error = Some(policy);
        self
    }

    /// Sets strict mode: artifacts are only reused on exact strict key
    /// matches.
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    /// Adds a remote spec that takes priority over every configured one.
    #[must_use]
    pub fn remote_override(mut self, spec: RemoteSpec) -> Self {
        self.remote_overrides.push(spec);
        self
    }

    /// Replaces the plugin registry (defaults to the built-in kinds).
    #[must_use]
    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Context> {
        let user_config = self.user_config.unwrap_or_default();

        let cachedir = self
            .cachedir
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("bst")))
            .unwrap_or_else(|| PathBuf::from(".bst-cache"));

        let sourcedir = self
            .sourcedir
            .or_else(|| user_config.sourcedir.clone())
            .unwrap_or_else(|| cachedir.join("sources"));
        let builddir = self
            .builddir
            .or_else(|| user_config.builddir.clone())
            .unwrap_or_else(|| cachedir.join("build"));
        let artifactdir = self
            .artifactdir
            .or_else(|| user_config.artifactdir.clone())
            .unwrap_or_else(|| cachedir.join("artifacts"));
        let logdir = self
            .logdir
            .or_else(|| user_config.logdir.clone())
            .unwrap_or_else(|| cachedir.join("logs"));

        let scheduler = &user_config.scheduler;
        Ok(Context {
            sourcedir,
            builddir,
            artifactdir,
            logdir,
            cache_quota: self.cache_quota.or(user_config.cache.quota),
            fetchers: self.fetchers.or(scheduler.fetchers).unwrap_or(10),
            builders: self
                .builders
                .or(scheduler.builders)
                .unwrap_or_else(|| num_cpus::get().clamp(1, 4)),
            pushers: self.pushers.or(scheduler.pushers).unwrap_or(4),
            network_retries: self.network_retries.or(scheduler.network_retries).unwrap_or(2),
            on_error: self.on_error.or(scheduler.on_error).unwrap_or_default(),
            strict: self.strict.unwrap_or(true),
            remote_overrides: self.remote_overrides,
            user_config,
            registry: Arc::new(self.registry.unwrap_or_else(PluginRegistry::with_builtins)),
        })
    }
}
