//! The pipeline: the loaded element DAG plus the session operations that
//! walk it.
//!
//! The element arena is owned by the pipeline and only ever mutated on the
//! control thread; worker jobs receive snapshots and report back records
//! (see [`scheduler`]). Elements are arranged dependencies-first, so a
//! single forward sweep updates state in a valid order.

use crate::{
    artifact::{ArtifactCache, ArtifactKeys},
    cas::CasCache,
    element::{Element, Scope, StagedDependency},
    error::{BstError, Result},
    loader::Loader,
    project::Project,
    remote::resolve_remote_specs,
    source::Consistency,
    Context,
};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

mod queue;
pub use queue::{Queue, QueueStatus, QueueType};

mod scheduler;
pub use scheduler::{SessionControl, SessionFailure, SessionResults};

/// Which part of the target closure a session or listing covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineSelection {
    /// Just the targets.
    None,
    /// Everything that must be built for the targets: the full closure
    /// minus elements that are already cached.
    Plan,
    /// The runtime closure of the targets.
    Run,
    /// The build closure of the targets.
    Build,
    /// The full closure.
    All,
}

/// A loaded dependency DAG bound to a context's caches.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) context: Context,
    pub(crate) projects: Vec<Project>,
    pub(crate) elements: Vec<Element>,
    pub(crate) targets: Vec<usize>,
    pub(crate) cas: Arc<CasCache>,
    pub(crate) artifacts: Arc<ArtifactCache>,
    context_key: String,
    project_keys: Vec<String>,
}

impl Pipeline {
    /// Loads the targets of the project at `project_dir` and wires up the
    /// local caches and remotes.
    #[instrument(skip(context), fields(project = %project_dir.display()))]
    pub fn load(context: &Context, project_dir: &Path, targets: &[&str]) -> Result<Self> {
        // The project name decides which user overrides apply, so the
        // declaration is read before the overrides are.
        let bare = Project::load(project_dir, &Default::default())?;
        let overrides = context.user_config.project_options(&bare.name);
        let project =
            if overrides.is_empty() { bare } else { Project::load(project_dir, &overrides)? };

        let cas = Arc::new(CasCache::new(context.artifactdir.join("cas"))?);
        let mut artifacts = ArtifactCache::new(
            cas.clone(),
            context.artifactdir.join("extract"),
            context.cache_quota,
        );
        let specs = resolve_remote_specs(
            &context.remote_overrides,
            context.user_config.project_artifacts(&project.name),
            &project.artifacts,
            &context.user_config.artifacts,
        );
        artifacts.initialize_remotes(&specs);

        let loader = Loader::new(&project, 0, &context.registry);
        let target_names: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        let (elements, target_indices) = loader.load(&target_names)?;

        let context_key = context.cache_key();
        let project_keys = vec![project.cache_key()];

        Ok(Self {
            context: context.clone(),
            projects: vec![project],
            elements,
            targets: target_indices,
            cas,
            artifacts: Arc::new(artifacts),
            context_key,
            project_keys,
        })
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn targets(&self) -> &[usize] {
        &self.targets
    }

    pub fn artifacts(&self) -> &Arc<ArtifactCache> {
        &self.artifacts
    }

    pub fn cas(&self) -> &Arc<CasCache> {
        &self.cas
    }

    pub fn project(&self) -> &Project {
        &self.projects[0]
    }

    pub fn element_index(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.name == name)
    }

    fn project_name(&self, index: usize) -> &str {
        &self.projects[self.elements[index].project].name
    }

    /// The dependency closure of one element in deterministic staging
    /// order: depth first, dependencies before dependents, edges visited in
    /// element name order.
    pub fn dependencies(&self, index: usize, scope: Scope) -> Vec<usize> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        match scope {
            Scope::All => self.visit_all(index, &mut out, &mut seen),
            Scope::Run => self.visit_run(index, &mut out, &mut seen),
            Scope::Build => {
                for dep in self.sorted_deps(&self.elements[index].build_deps) {
                    self.visit_run(dep, &mut out, &mut seen);
                }
            }
        }
        out
    }

    fn sorted_deps(&self, deps: &[usize]) -> Vec<usize> {
        let mut sorted: Vec<usize> = deps.to_vec();
        sorted.sort_by(|&a, &b| self.elements[a].name.cmp(&self.elements[b].name));
        sorted.dedup();
        sorted
    }

    fn visit_all(&self, index: usize, out: &mut Vec<usize>, seen: &mut BTreeSet<usize>) {
        if !seen.insert(index) {
            return;
        }
        let mut edges = self.elements[index].build_deps.clone();
        edges.extend(&self.elements[index].runtime_deps);
        for dep in self.sorted_deps(&edges) {
            self.visit_all(dep, out, seen);
        }
        out.push(index);
    }

    fn visit_run(&self, index: usize, out: &mut Vec<usize>, seen: &mut BTreeSet<usize>) {
        if !seen.insert(index) {
            return;
        }
        for dep in self.sorted_deps(&self.elements[index].runtime_deps) {
            self.visit_run(dep, out, seen);
        }
        out.push(index);
    }

    /// The elements a session over the targets covers, in staging order.
    pub fn plan(&self, selection: PipelineSelection) -> Vec<usize> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        for &target in &self.targets {
            let closure = match selection {
                PipelineSelection::None => vec![target],
                PipelineSelection::Run => self.dependencies(target, Scope::Run),
                PipelineSelection::Build => self.dependencies(target, Scope::Build),
                PipelineSelection::All | PipelineSelection::Plan => {
                    self.dependencies(target, Scope::All)
                }
            };
            for index in closure {
                if seen.insert(index) {
                    out.push(index);
                }
            }
        }
        if selection == PipelineSelection::Plan {
            out.retain(|&index| !self.elements[index].state.cached);
        }
        out
    }

    /// Elements that directly depend on `index`.
    pub(crate) fn reverse_deps(&self, index: usize) -> Vec<usize> {
        (0..self.elements.len())
            .filter(|&i| {
                self.elements[i].build_deps.contains(&index)
                    || self.elements[i].runtime_deps.contains(&index)
            })
            .collect()
    }

    /// The transitive reverse dependency closure, in arena (topological)
    /// order.
    pub(crate) fn reverse_closure(&self, index: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut frontier = vec![index];
        while let Some(current) = frontier.pop() {
            for dependent in self.reverse_deps(current) {
                if seen.insert(dependent) {
                    frontier.push(dependent);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Whether the element could be built right now: all sources cached and
    /// the whole build scope locally cached.
    pub fn buildable(&self, index: usize) -> bool {
        self.elements[index].consistency() == Consistency::Cached
            && self
                .dependencies(index, Scope::Build)
                .iter()
                .all(|&dep| self.elements[dep].state.cached)
    }

    /// Whether a pull could still populate the local cache for this
    /// element.
    pub fn pull_pending(&self, index: usize) -> bool {
        let state = &self.elements[index].state;
        if state.pull_failed {
            return false;
        }
        (!state.strong_cached && state.remotely_strong_cached)
            || (!state.cached && state.remotely_cached)
    }

    /// Whether the element's artifact descends from an open workspace.
    pub fn tainted(&self, index: usize) -> bool {
        self.elements[index].is_workspaced()
            || self
                .dependencies(index, Scope::Build)
                .iter()
                .any(|&dep| self.elements[dep].is_workspaced())
    }

    /// Whether cache queries may run for the element yet.
    pub(crate) fn can_query_cache(&self, index: usize) -> bool {
        let state = &self.elements[index].state;
        state.assemble_scheduled || state.strict_key.is_some()
    }

    /// Re-evaluates one element's state machine. Idempotent; called after
    /// every job on the element and its reverse dependency closure.
    pub fn update_state(&mut self, index: usize) -> Result<()> {
        for source in &mut self.elements[index].sources {
            source.update_state()?;
        }
        if self.elements[index].consistency() == Consistency::Inconsistent {
            // Tracking is still pending; cache keys stay unknown.
            return Ok(());
        }

        if !self.elements[index].sources_stable() {
            // Workspace content can change until the build runs; any keys
            // derived from it are meaningless until then.
            let state = &mut self.elements[index].state;
            state.invalidate_keys();
            if !state.assemble_scheduled && !state.assemble_done {
                state.assemble_scheduled = true;
            }
            return Ok(());
        }

        let project_key = self.project_keys[self.elements[index].project].clone();
        let Some(base) = self.elements[index].cache_key_base(&self.context_key, &project_key)?
        else {
            return Ok(());
        };

        if self.elements[index].state.weak_key.is_none() {
            // The weak key rolls in dependency names only.
            let dep_names: Vec<serde_json::Value> = self
                .sorted_deps(&self.elements[index].build_deps)
                .iter()
                .map(|&dep| serde_json::Value::String(self.elements[dep].name.clone()))
                .collect();
            self.elements[index].state.weak_key = Some(Element::calculate_key(&base, dep_names));
        }

        let project = self.project_name(index).to_string();
        let normal = self.elements[index].normal_name.clone();
        let strict = self.context.strict;

        if !strict {
            let weak = self.elements[index].state.weak_key.clone().expect("just computed");
            let cached = self.artifacts.contains(&project, &normal, &weak);
            let remotely_cached = self.artifacts.remote_contains(&project, &normal, &weak)?;
            let state = &mut self.elements[index].state;
            if !state.assemble_scheduled
                && !state.assemble_done
                && !cached
                && !remotely_cached
            {
                state.assemble_scheduled = true;
                return Ok(());
            }
        }

        if self.elements[index].state.strict_key.is_none() {
            let mut dep_keys = Vec::new();
            for dep in self.dependencies(index, Scope::Build) {
                match &self.elements[dep].state.strict_key {
                    Some(key) => dep_keys.push(serde_json::Value::String(key.clone())),
                    None => return Ok(()),
                }
            }
            self.elements[index].state.strict_key = Some(Element::calculate_key(&base, dep_keys));
        }

        let weak_key = self.elements[index].state.weak_key.clone().expect("computed above");
        let strict_key = self.elements[index].state.strict_key.clone().expect("computed above");
        let lookup_key = if strict { &strict_key } else { &weak_key };
        {
            let cached = self.artifacts.contains(&project, &normal, lookup_key);
            let remotely_cached = self.artifacts.remote_contains(&project, &normal, lookup_key)?;
            let strong_cached = self.artifacts.contains(&project, &normal, &strict_key);
            let remotely_strong_cached =
                self.artifacts.remote_contains(&project, &normal, &strict_key)?;
            let state = &mut self.elements[index].state;
            state.cached |= cached;
            state.remotely_cached |= remotely_cached;
            state.strong_cached |= strong_cached;
            state.remotely_strong_cached |= remotely_strong_cached;

            if !state.assemble_scheduled
                && !state.assemble_done
                && !state.cached
                && !state.remotely_cached
            {
                state.assemble_scheduled = true;
                return Ok(());
            }
        }

        if self.elements[index].state.strong_key.is_none() {
            if strict {
                self.elements[index].state.strong_key = Some(strict_key);
            } else if self.pull_pending(index) {
                // The effective strong key is unknown until after the pull.
            } else if self.elements[index].state.cached {
                let meta = self.artifacts.load_meta(&project, &normal, &weak_key)?;
                self.elements[index].state.strong_key = Some(meta.keys.strong);
            } else if self.buildable(index) {
                let mut dep_keys = Vec::new();
                for dep in self.dependencies(index, Scope::Build) {
                    match &self.elements[dep].state.strong_key {
                        Some(key) => dep_keys.push(serde_json::Value::String(key.clone())),
                        None => return Ok(()),
                    }
                }
                self.elements[index].state.strong_key =
                    Some(Element::calculate_key(&base, dep_keys));
            }
        }
        Ok(())
    }

    /// Runs the state machine over the whole arena, dependencies first.
    pub fn resolve_state(&mut self) -> Result<()> {
        for index in 0..self.elements.len() {
            self.update_state(index)?;
        }
        Ok(())
    }

    /// The commit keys for a build dispatched right now.
    ///
    /// For stable elements these are the session keys; for workspaced
    /// elements (whose session keys are deliberately unknown) the keys are
    /// derived from the current workspace content.
    pub(crate) fn commit_keys(&self, index: usize) -> Result<ArtifactKeys> {
        let project_key = self.project_keys[self.elements[index].project].clone();
        let base = self.elements[index]
            .cache_key_base(&self.context_key, &project_key)?
            .ok_or_else(|| {
                BstError::pipeline(format!(
                    "cache keys for {} are not computable at build time",
                    self.elements[index].name
                ))
            })?;

        let weak = match &self.elements[index].state.weak_key {
            Some(key) => key.clone(),
            None => {
                let dep_names: Vec<serde_json::Value> = self
                    .sorted_deps(&self.elements[index].build_deps)
                    .iter()
                    .map(|&dep| serde_json::Value::String(self.elements[dep].name.clone()))
                    .collect();
                Element::calculate_key(&base, dep_names)
            }
        };
        let strong = match &self.elements[index].state.strong_key {
            Some(key) => key.clone(),
            None => {
                let mut dep_keys = Vec::new();
                for dep in self.dependencies(index, Scope::Build) {
                    let key = self.elements[dep].state.strong_key.clone().ok_or_else(|| {
                        BstError::pipeline(format!(
                            "dependency {} has no strong key at build time",
                            self.elements[dep].name
                        ))
                    })?;
                    dep_keys.push(serde_json::Value::String(key));
                }
                Element::calculate_key(&base, dep_keys)
            }
        };

        let mut dependencies = std::collections::BTreeMap::new();
        for &dep in &self.elements[index].build_deps {
            if let Some(key) = &self.elements[dep].state.strong_key {
                dependencies.insert(self.elements[dep].name.clone(), key.clone());
            }
        }
        Ok(ArtifactKeys { strong, weak, dependencies })
    }

    /// The staging list for a build of `index`: its build scope, bottom up,
    /// with each dependency's overlap policy attached.
    pub(crate) fn staged_dependencies(&self, index: usize) -> Result<Vec<StagedDependency>> {
        let mut staged = Vec::new();
        for dep in self.dependencies(index, Scope::Build) {
            let element = &self.elements[dep];
            let project = &self.projects[element.project];
            let key = self.local_artifact_key(dep).ok_or_else(|| {
                BstError::element(format!(
                    "dependency {} has not yet produced an artifact",
                    element.name
                ))
                .with_reason("missing-artifact")
            })?;
            staged.push(StagedDependency {
                element_name: element.name.clone(),
                normal_name: element.normal_name.clone(),
                project_name: project.name.clone(),
                strong_key: key,
                whitelist: element.public.bst.overlap_whitelist.clone(),
                fatal_overlaps: project.is_fatal_warning(crate::project::warnings::OVERLAPS),
                integration_commands: element.public.bst.integration_commands.clone(),
            });
        }
        Ok(staged)
    }

    /// The key whose ref is locally present for this element, preferring
    /// the strict key.
    pub(crate) fn local_artifact_key(&self, index: usize) -> Option<String> {
        let element = &self.elements[index];
        let project = self.project_name(index);
        for key in [&element.state.strict_key, &element.state.strong_key, &element.state.weak_key]
            .into_iter()
            .flatten()
        {
            if self.artifacts.contains(project, &element.normal_name, key) {
                return Some(key.clone());
            }
        }
        None
    }

    /// Freezes the session's plan against cache eviction and refreshes the
    /// timestamps of the refs it will use.
    pub(crate) fn freeze_required_artifacts(&self, plan: &[usize]) {
        for &index in plan {
            let element = &self.elements[index];
            let keys: Vec<String> = [&element.state.strict_key, &element.state.weak_key]
                .into_iter()
                .flatten()
                .cloned()
                .collect();
            if !keys.is_empty() {
                self.artifacts.mark_required(self.project_name(index), &element.normal_name, &keys);
            }
        }
    }

    fn assert_consistent(&self, plan: &[usize]) -> Result<()> {
        let inconsistent: Vec<&str> = plan
            .iter()
            .filter(|&&index| self.elements[index].consistency() == Consistency::Inconsistent)
            .map(|&index| self.elements[index].name.as_str())
            .collect();
        if inconsistent.is_empty() {
            Ok(())
        } else {
            Err(BstError::pipeline(format!(
                "inconsistent pipeline: elements have no pinned references: {}",
                inconsistent.join(", ")
            ))
            .with_reason("inconsistent-pipeline"))
        }
    }

    /// Builds the targets: fetch, pull, build and (when push remotes are
    /// configured) push, over the full closure.
    pub fn build(&mut self, control: &SessionControl) -> Result<SessionResults> {
        self.resolve_state()?;
        let plan = self.plan(PipelineSelection::All);
        self.assert_consistent(&plan)?;
        self.freeze_required_artifacts(&plan);

        let mut queues = vec![QueueType::Fetch];
        if self.artifacts.has_fetch_remotes() {
            queues.push(QueueType::Pull);
        }
        queues.push(QueueType::Build);
        if self.artifacts.has_push_remotes() {
            queues.push(QueueType::Push);
        }
        scheduler::Scheduler::new(self, queues, plan, control).run()
    }

    /// Fetches every source in the selected closure.
    pub fn fetch(
        &mut self,
        selection: PipelineSelection,
        control: &SessionControl,
    ) -> Result<SessionResults> {
        self.resolve_state()?;
        let plan = self.plan(selection);
        self.assert_consistent(&plan)?;
        scheduler::Scheduler::new(self, vec![QueueType::Fetch], plan, control).run()
    }

    /// Tracks every trackable source in the selected closure, then reports
    /// the new refs.
    pub fn track(
        &mut self,
        selection: PipelineSelection,
        control: &SessionControl,
    ) -> Result<SessionResults> {
        self.resolve_state()?;
        let plan = self.plan(selection);
        scheduler::Scheduler::new(self, vec![QueueType::Track], plan, control).run()
    }

    /// Pulls whatever the remotes hold for the selected closure.
    pub fn pull(
        &mut self,
        selection: PipelineSelection,
        control: &SessionControl,
    ) -> Result<SessionResults> {
        if !self.artifacts.has_fetch_remotes() {
            return Err(BstError::pipeline("no remote artifact caches are configured")
                .with_reason("no-remotes"));
        }
        self.resolve_state()?;
        let plan = self.plan(selection);
        self.freeze_required_artifacts(&plan);
        scheduler::Scheduler::new(self, vec![QueueType::Pull], plan, control).run()
    }

    /// Pushes locally cached artifacts in the selected closure.
    pub fn push(
        &mut self,
        selection: PipelineSelection,
        control: &SessionControl,
    ) -> Result<SessionResults> {
        if !self.artifacts.has_push_remotes() {
            return Err(BstError::pipeline("no push remotes are configured")
                .with_reason("no-remotes"));
        }
        self.resolve_state()?;
        let plan = self.plan(selection);
        self.freeze_required_artifacts(&plan);
        scheduler::Scheduler::new(self, vec![QueueType::Push], plan, control).run()
    }

    /// Checks the built artifact of `target` out into `directory`.
    pub fn checkout(&mut self, target: usize, directory: &Path, hardlinks: bool) -> Result<()> {
        self.resolve_state()?;
        let element = &self.elements[target];
        let key = self.local_artifact_key(target).ok_or_else(|| {
            BstError::element(format!("{} has no cached artifact to checkout", element.name))
                .with_reason("missing-artifact")
        })?;
        let extracted =
            self.artifacts.extract(self.project_name(target), &element.normal_name, &key)?;
        let files = crate::vdir::FsDir::new(extracted.join(crate::artifact::FILES_DIR))?;
        files.export_files(directory, hardlinks, false)
    }

    /// The element's session state, for frontends rendering `show` output.
    pub fn element_state(&self, index: usize) -> &crate::element::ElementState {
        &self.elements[index].state
    }

    /// The per-element log file for one queue action.
    pub(crate) fn logfile(&self, index: usize, action: &str) -> PathBuf {
        let element = &self.elements[index];
        let key = element
            .state
            .strong_key
            .as_deref()
            .or(element.state.weak_key.as_deref())
            .unwrap_or("unknown");
        let brief = &key[..key.len().min(8)];
        self.context
            .logdir
            .join(self.project_name(index))
            .join(&element.normal_name)
            .join(format!("{brief}-{action}.{}.log", std::process::id()))
    }
}
