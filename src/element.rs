//! Elements: the declarative build units the pipeline schedules.
//!
//! The data an element carries is split by mutability: everything loaded
//! from its declaration is immutable for the session, while
//! [`ElementState`] tracks the per-session state machine (cache keys,
//! cached flags, scheduling bits). The build job itself runs against a
//! [`BuildContext`] snapshot so worker threads never touch pipeline state.

use crate::{
    artifact::{ArtifactCache, ArtifactKeys, ArtifactMeta, BUILD_LOG, FILES_DIR, META_ARTIFACT, META_PUBLIC},
    cachekey,
    error::{BstError, Result},
    project::warnings,
    sandbox::{HostSandbox, OverlapCollector, OverlapPolicy, Sandbox, SandboxFlags},
    source::{Consistency, Source, SourcePlugin},
    utils,
    vdir::{FsDir, ImportOptions},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

/// The scopes a dependency closure can be computed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Everything: build and runtime dependencies, transitively, plus the
    /// element itself.
    All,
    /// What must be staged to build the element: each build dependency
    /// with its runtime closure. Excludes the element itself.
    Build,
    /// What must be staged to run the element: the runtime closure plus
    /// the element itself.
    Run,
}

/// The contract element kinds implement.
///
/// Plugins are configured at load time from their YAML `config` node and
/// shared immutably with build workers; everything session dependent
/// arrives through the [`BuildContext`].
pub trait ElementPlugin: Send + Sync + fmt::Debug {
    /// The element kind identifier, e.g. `"manual"`.
    fn kind(&self) -> &str;

    /// The plugin configuration's contribution to the cache key.
    fn unique_key(&self) -> Value;

    /// Asserts host side requirements early.
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// Phase one: declare marked directories and sandbox defaults.
    fn configure_sandbox(&self, build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<()>;

    /// Phase two: stage dependency artifacts and sources.
    fn stage(&self, build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<()>;

    /// Phase three: run the build commands.
    ///
    /// Returns the absolute in-sandbox path of the directory to collect as
    /// the artifact payload.
    fn assemble(&self, build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<String>;

    /// An optional shell script reproducing the build outside the
    /// pipeline.
    fn generate_script(&self, build: &BuildContext) -> Option<String> {
        let _ = build;
        None
    }
}

/// The `public` section of an element declaration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicData {
    #[serde(default)]
    pub bst: BstPublic,
}

/// The `bst` public data domain consumed by the core itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BstPublic {
    #[serde(default, rename = "integration-commands")]
    pub integration_commands: Vec<String>,
    #[serde(default, rename = "split-rules")]
    pub split_rules: BTreeMap<String, Vec<String>>,
    #[serde(default, rename = "overlap-whitelist")]
    pub overlap_whitelist: Vec<String>,
}

/// The per-session state machine fields of one element.
#[derive(Clone, Debug, Default)]
pub struct ElementState {
    pub weak_key: Option<String>,
    pub strict_key: Option<String>,
    pub strong_key: Option<String>,
    /// Cached locally at the effective key (strict in strict mode, weak
    /// otherwise).
    pub cached: bool,
    pub remotely_cached: bool,
    /// Cached locally at the strict key.
    pub strong_cached: bool,
    pub remotely_strong_cached: bool,
    pub assemble_scheduled: bool,
    pub assemble_done: bool,
    pub pull_failed: bool,
    /// The session failed this element (or a dependency of it).
    pub failed: bool,
}

impl ElementState {
    pub(crate) fn invalidate_keys(&mut self) {
        self.weak_key = None;
        self.strict_key = None;
        self.strong_key = None;
        self.cached = false;
        self.remotely_cached = false;
        self.strong_cached = false;
        self.remotely_strong_cached = false;
    }
}

/// A loaded element.
#[derive(Debug)]
pub struct Element {
    pub name: String,
    pub normal_name: String,
    pub kind: String,
    /// Index of the owning project in the context's project arena.
    pub project: usize,
    pub plugin: Arc<dyn ElementPlugin>,
    pub sources: Vec<Source>,
    /// Direct dependencies, as indices into the element arena.
    pub build_deps: Vec<usize>,
    pub runtime_deps: Vec<usize>,
    pub environment: BTreeMap<String, String>,
    pub environment_nocache: Vec<String>,
    pub variables: BTreeMap<String, String>,
    pub public: PublicData,
    /// Project split rules composed with the element's own.
    pub split_rules: BTreeMap<String, Vec<String>>,
    pub state: ElementState,
}

impl Element {
    /// The element's consistency: the minimum over its sources.
    pub fn consistency(&self) -> Consistency {
        self.sources.iter().map(|s| s.consistency).min().unwrap_or(Consistency::Cached)
    }

    /// Whether every source produces stable cache keys right now.
    pub fn sources_stable(&self) -> bool {
        self.sources.iter().all(|s| s.plugin.is_stable())
    }

    /// Whether any source is an open workspace.
    pub fn is_workspaced(&self) -> bool {
        self.sources.iter().any(|s| s.plugin.is_workspace())
    }

    /// The invariant part of the cache key dictionary.
    ///
    /// Returns `None` while any contributing input is unknown (a source
    /// without a pinned ref).
    pub fn cache_key_base(&self, context_key: &str, project_key: &str) -> Result<Option<Value>> {
        let mut source_keys = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.plugin.unique_key()? {
                Some(key) => source_keys.push(key),
                None => return Ok(None),
            }
        }
        let cache_env: BTreeMap<&String, &String> = self
            .environment
            .iter()
            .filter(|(key, _)| !self.environment_nocache.contains(key))
            .collect();
        Ok(Some(serde_json::json!({
            "artifact-version": cachekey::CORE_ARTIFACT_VERSION,
            "context": context_key,
            "project": project_key,
            "element": self.plugin.unique_key(),
            "execution-environment": cachekey::execution_environment(),
            "environment": cache_env,
            "sources": source_keys,
            "public": serde_json::to_value(&self.public)?,
            "cache": "cas",
        })))
    }

    /// Rolls dependency keys into the base dictionary and hashes it.
    pub fn calculate_key(base: &Value, dependencies: Vec<Value>) -> String {
        let mut dict = base.clone();
        dict.as_object_mut()
            .expect("cache key base is always a mapping")
            .insert("dependencies".to_string(), Value::Array(dependencies));
        cachekey::generate_key(&dict)
    }
}

/// One dependency artifact to stage, in staging order.
#[derive(Clone, Debug)]
pub struct StagedDependency {
    pub element_name: String,
    pub normal_name: String,
    pub project_name: String,
    /// The key whose artifact gets staged.
    pub strong_key: String,
    /// The dependency's overlap whitelist globs.
    pub whitelist: Vec<String>,
    /// Whether the dependency's project promotes overlaps to errors.
    pub fatal_overlaps: bool,
    pub integration_commands: Vec<String>,
}

/// Everything a build worker needs to assemble one element.
///
/// Assembled on the control thread from pipeline state, then moved into the
/// job; workers never reach back into the pipeline.
#[derive(Debug)]
pub struct BuildContext {
    pub element_name: String,
    pub normal_name: String,
    pub project_name: String,
    pub variables: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub sources: Vec<Arc<dyn SourcePlugin>>,
    /// The build scope dependencies, bottom up.
    pub deps: Vec<StagedDependency>,
    /// Project split rules composed with the element's own.
    pub split_rules: BTreeMap<String, Vec<String>>,
    pub public: PublicData,
    pub fatal_warnings: Vec<String>,
    pub commit_keys: ArtifactKeys,
    pub workspaced: bool,
    pub workspaced_dependencies: Vec<String>,
    pub artifacts: Arc<ArtifactCache>,
    pub logfile: PathBuf,
    pub cancel: Arc<AtomicBool>,
}

impl BuildContext {
    /// Looks up a substituted variable.
    pub fn variable(&self, name: &str) -> Result<&str> {
        self.variables.get(name).map(String::as_str).ok_or_else(|| {
            BstError::load(format!(
                "element {} references unresolved variable %{{{name}}}",
                self.element_name
            ))
            .with_reason("unresolved-variable")
        })
    }

    /// Stages every build scope dependency artifact into the sandbox,
    /// enforcing the overlap policy.
    ///
    /// Artifacts are extracted from the cache and hardlinked into the root;
    /// every import's report feeds the overlap collector, which aborts with
    /// `overlap-error` before any command runs if a non-whitelisted overlap
    /// hits a project that promotes overlaps.
    pub fn stage_dependency_artifacts(
        &self,
        sandbox: &mut dyn Sandbox,
        path: Option<&str>,
    ) -> Result<()> {
        let root = FsDir::new(sandbox.root())?;
        let target = match path {
            Some(path) => root.descend(path, true)?,
            None => root,
        };

        let mut collector = OverlapCollector::new();
        let mut policies = BTreeMap::new();
        for dep in &self.deps {
            let extracted =
                self.artifacts.extract(&dep.project_name, &dep.normal_name, &dep.strong_key)?;
            let files = extracted.join(FILES_DIR);
            let result = target.import_files(&files, &ImportOptions::linked())?;
            trace!(dep = %dep.element_name, staged = result.files_written.len(), "staged dependency");
            policies.insert(
                dep.element_name.clone(),
                OverlapPolicy::new(&dep.whitelist, dep.fatal_overlaps)?,
            );
            collector.record(&dep.element_name, &result);
        }

        let outcome = collector.resolve(&policies)?;
        for warning in &outcome.warnings {
            warn!(element = %self.element_name, "{warning}");
        }
        if !outcome.ignored.is_empty() {
            let mut detail = String::from("not staging files which would replace non-empty directories:\n");
            for (dep, paths) in &outcome.ignored {
                detail.push_str(&format!("from {dep}:\n"));
                for path in paths {
                    detail.push_str(&format!("  /{path}\n"));
                }
            }
            if self.fatal_warnings.iter().any(|w| w == warnings::IGNORED_FILES) {
                return Err(BstError::element("ignored files detected during staging")
                    .with_reason(warnings::IGNORED_FILES)
                    .with_detail(detail));
            }
            warn!(element = %self.element_name, "{detail}");
        }
        Ok(())
    }

    /// Stages this element's sources below `directory` inside the sandbox.
    pub fn stage_sources(&self, sandbox: &mut dyn Sandbox, directory: &str) -> Result<()> {
        let root = FsDir::new(sandbox.root())?;
        let target = root.descend(directory, true)?;
        for source in &self.sources {
            source.stage(target.path())?;
        }
        Ok(())
    }

    /// Runs the integration commands of every staged dependency.
    ///
    /// Integration mutates the staged sysroot (ld caches and the like), so
    /// the root is writable for these commands.
    pub fn integrate(&self, sandbox: &mut dyn Sandbox) -> Result<()> {
        for dep in &self.deps {
            for command in &dep.integration_commands {
                info!(element = %self.element_name, dep = %dep.element_name, %command, "integration");
                let argv =
                    vec!["sh".to_string(), "-e".to_string(), "-c".to_string(), command.clone()];
                let exit = sandbox.run(&argv, SandboxFlags::NONE, Some("/"), None)?;
                if exit != 0 {
                    return Err(BstError::element(format!(
                        "integration command {command:?} failed with exit code {exit}"
                    ))
                    .with_reason("command-failed"));
                }
            }
        }
        Ok(())
    }

    /// Slices a path list by this element's split-rule domains; see
    /// [`split_filter`](crate::element::split_filter).
    pub fn split_filter(
        &self,
        paths: &[String],
        include: &[String],
        exclude: &[String],
        orphans: bool,
    ) -> Result<Vec<String>> {
        split_filter(&self.split_rules, paths, include, exclude, orphans)
    }

    /// Runs one build command, turning a non-zero exit into an element
    /// error.
    pub fn run_command(&self, sandbox: &mut dyn Sandbox, command: &str, cwd: &str) -> Result<()> {
        let argv = vec!["sh".to_string(), "-e".to_string(), "-c".to_string(), command.to_string()];
        let exit = sandbox.run(&argv, SandboxFlags::ROOT_READ_ONLY, Some(cwd), None)?;
        if exit != 0 {
            return Err(BstError::element(format!(
                "command {command:?} failed with exit code {exit}"
            ))
            .with_reason("command-failed"));
        }
        Ok(())
    }
}

/// Slices a path list by split-rule domains.
///
/// With an empty `include`, every domain is included. A path spoken for by
/// no domain is an orphan and follows the `orphans` flag; a path in any
/// excluded domain is dropped even when also included. This is the
/// filtering element plugins apply when staging a sliced artifact.
pub fn split_filter(
    split_rules: &BTreeMap<String, Vec<String>>,
    paths: &[String],
    include: &[String],
    exclude: &[String],
    orphans: bool,
) -> Result<Vec<String>> {
    let domains: Vec<&String> = split_rules.keys().collect();
    let include: Vec<&String> =
        if include.is_empty() { domains.clone() } else { include.iter().collect() };

    let mut compiled: BTreeMap<&str, Vec<regex::Regex>> = BTreeMap::new();
    for (domain, globs) in split_rules {
        let mut regexes = Vec::with_capacity(globs.len());
        for glob in globs {
            let anchored = if glob.starts_with('/') { glob.clone() } else { format!("/{glob}") };
            regexes.push(regex::Regex::new(&utils::glob_to_regex(&anchored)).map_err(|err| {
                BstError::load(format!("invalid split rule pattern {glob:?}: {err}"))
            })?);
        }
        compiled.insert(domain, regexes);
    }

    let mut selected = Vec::new();
    for path in paths {
        let absolute = if path.starts_with('/') { path.clone() } else { format!("/{path}") };
        let matched: Vec<&str> = compiled
            .iter()
            .filter(|(_, regexes)| regexes.iter().any(|re| re.is_match(&absolute)))
            .map(|(domain, _)| *domain)
            .collect();
        let keep = if matched.is_empty() {
            orphans
        } else {
            matched.iter().any(|d| include.iter().any(|i| i.as_str() == *d))
                && !matched.iter().any(|d| exclude.iter().any(|e| e.as_str() == *d))
        };
        if keep {
            selected.push(path.clone());
        }
    }
    Ok(selected)
}

/// Drives the three phase staging protocol for one element and commits the
/// result.
#[derive(Debug)]
pub struct Assembler {
    pub build: BuildContext,
    pub plugin: Arc<dyn ElementPlugin>,
    /// Scratch space for sandbox roots.
    pub builddir: PathBuf,
}

impl Assembler {
    /// Assembles and commits the artifact under its strong and weak keys.
    ///
    /// On failure the sandbox root is left in place and its path attached
    /// to the error for debugging.
    #[instrument(skip(self), fields(element = %self.build.element_name))]
    pub fn assemble(self) -> Result<()> {
        fs::create_dir_all(&self.builddir).map_err(|err| BstError::io(err, &self.builddir))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", self.build.normal_name))
            .tempdir_in(&self.builddir)
            .map_err(|err| BstError::io(err, &self.builddir))?;

        match self.assemble_in(scratch.path()) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Keep the sandbox around for inspection.
                let kept = scratch.keep();
                Err(err.with_sandbox(kept))
            }
        }
    }

    fn assemble_in(&self, scratch: &std::path::Path) -> Result<()> {
        utils::create_parent_dir_all(&self.build.logfile)?;
        let root = scratch.join("root");
        let mut sandbox = HostSandbox::new(&root)?
            .with_log(&self.build.logfile)
            .with_cancel(self.build.cancel.clone());
        sandbox.set_environment(self.build.environment.clone());

        self.plugin.configure_sandbox(&self.build, &mut sandbox)?;
        self.plugin.stage(&self.build, &mut sandbox)?;
        let collect = self.plugin.assemble(&self.build, &mut sandbox)?;

        let collect_dir = FsDir::new(&root)?.descend(&collect, false).map_err(|_| {
            BstError::element(format!(
                "output directory {collect:?} was not found inside the sandbox"
            ))
            .with_reason("missing-output")
        })?;

        // Lay out the artifact: payload, log, metadata.
        let assembly = scratch.join("artifact");
        collect_dir.export_files(&assembly.join(FILES_DIR), true, true)?;

        let log_dest = assembly.join(BUILD_LOG);
        utils::create_parent_dir_all(&log_dest)?;
        if self.build.logfile.is_file() {
            fs::copy(&self.build.logfile, &log_dest)
                .map_err(|err| BstError::io(err, &log_dest))?;
        } else {
            fs::write(&log_dest, b"").map_err(|err| BstError::io(err, &log_dest))?;
        }

        let meta = ArtifactMeta {
            keys: self.build.commit_keys.clone(),
            workspaced: self.build.workspaced,
            workspaced_dependencies: self.build.workspaced_dependencies.clone(),
        };
        utils::create_parent_dir_all(&assembly.join(META_ARTIFACT))?;
        utils::save_file_atomic(
            &assembly.join(META_ARTIFACT),
            serde_yaml::to_string(&meta)?.as_bytes(),
        )?;
        utils::save_file_atomic(
            &assembly.join(META_PUBLIC),
            serde_yaml::to_string(&self.build.public)?.as_bytes(),
        )?;

        let keys =
            vec![self.build.commit_keys.strong.clone(), self.build.commit_keys.weak.clone()];
        self.build.artifacts.commit(
            &self.build.project_name,
            &self.build.normal_name,
            &assembly,
            &keys,
        )
    }
}
