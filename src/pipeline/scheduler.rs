//! The session scheduler.
//!
//! One control thread owns all pipeline state. Jobs run on worker threads
//! against snapshots assembled here and report back over a channel as plain
//! records; every mutation of element state happens on the control thread
//! when a record arrives, after which the element and its reverse
//! dependency closure are re-evaluated.

use crate::{
    artifact::ArtifactKeys,
    element::Assembler,
    error::{self, BstError, Result},
    pipeline::{
        queue::{Queue, QueueStatus, QueueType},
        Pipeline,
    },
    source::Consistency,
    OnErrorPolicy,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Cooperative cancellation handle for a running session.
///
/// Terminating stops new job dispatch and signals in-flight sandbox
/// commands, whose child processes are killed; the scheduler then drains
/// the in-flight jobs and reports the session as terminated.
#[derive(Clone, Debug, Default)]
pub struct SessionControl {
    terminate: Arc<AtomicBool>,
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests session termination.
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }
}

/// One failed element of a session, with the machine readable error
/// identity preserved.
#[derive(Clone, Debug)]
pub struct SessionFailure {
    pub element: String,
    pub message: String,
    pub domain: crate::error::ErrorDomain,
    pub reason: Option<String>,
}

/// What a finished session has to report.
#[derive(Clone, Debug, Default)]
pub struct SessionResults {
    /// Elements whose sources produced new tracked refs.
    pub tracked: Vec<(String, Vec<String>)>,
    pub fetched: Vec<String>,
    pub pulled: Vec<String>,
    pub built: Vec<String>,
    pub pushed: Vec<String>,
    pub failed: Vec<SessionFailure>,
    /// The session was cancelled before completing.
    pub terminated: bool,
}

impl SessionResults {
    /// Whether every dispatched job succeeded and the session ran to
    /// completion.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.terminated
    }
}

enum JobOutcome {
    Tracked(Vec<Option<String>>),
    Fetched,
    Pulled { pulled: bool, resolved_strong: Option<String> },
    Built(ArtifactKeys),
    Pushed(bool),
}

struct JobResult {
    element: usize,
    queue_index: usize,
    outcome: Result<JobOutcome>,
}

pub(crate) struct Scheduler<'a> {
    pipeline: &'a mut Pipeline,
    queues: Vec<Queue>,
    plan: Vec<usize>,
    control: &'a SessionControl,
    /// Per plan element: the queue it currently sits in.
    position: BTreeMap<usize, usize>,
    active: BTreeSet<usize>,
    attempts: BTreeMap<(usize, usize), u32>,
    tx: Sender<JobResult>,
    rx: Receiver<JobResult>,
    results: SessionResults,
    quitting: bool,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(
        pipeline: &'a mut Pipeline,
        queue_types: Vec<QueueType>,
        plan: Vec<usize>,
        control: &'a SessionControl,
    ) -> Self {
        let queues = queue_types
            .into_iter()
            .map(|queue_type| {
                let cap = match queue_type {
                    QueueType::Track | QueueType::Fetch | QueueType::Pull => {
                        pipeline.context.fetchers
                    }
                    QueueType::Build => pipeline.context.builders,
                    QueueType::Push => pipeline.context.pushers,
                };
                Queue::new(queue_type, cap)
            })
            .collect();
        let position = plan.iter().map(|&index| (index, 0usize)).collect();
        let (tx, rx) = unbounded();
        Self {
            pipeline,
            queues,
            plan,
            control,
            position,
            active: BTreeSet::new(),
            attempts: BTreeMap::new(),
            tx,
            rx,
            results: SessionResults::default(),
            quitting: false,
        }
    }

    /// Runs the session to completion (or termination).
    pub(crate) fn run(mut self) -> Result<SessionResults> {
        loop {
            if !self.quitting && self.control.is_terminated() {
                self.quitting = true;
                self.results.terminated = true;
            }

            let dispatched = if self.quitting { 0 } else { self.dispatch()? };

            if self.active.is_empty() {
                if self.quitting || self.all_done() {
                    break;
                }
                if dispatched == 0 {
                    return Err(BstError::pipeline(
                        "scheduler stalled: elements are waiting but nothing is running",
                    )
                    .with_reason("scheduler-stalled"));
                }
                continue;
            }

            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(result) => self.apply(result)?,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(BstError::pipeline("job channel closed unexpectedly")
                        .with_reason("scheduler-stalled"))
                }
            }
        }
        Ok(self.results)
    }

    fn all_done(&self) -> bool {
        self.plan.iter().all(|&index| {
            self.position[&index] >= self.queues.len() || self.pipeline.elements[index].state.failed
        })
    }

    /// Walks the plan in staging order, advancing elements through queues
    /// and dispatching everything that is ready under the caps.
    fn dispatch(&mut self) -> Result<usize> {
        let mut dispatched = 0;
        for plan_index in 0..self.plan.len() {
            let element = self.plan[plan_index];
            if self.active.contains(&element) {
                continue;
            }
            loop {
                let queue_index = self.position[&element];
                if queue_index >= self.queues.len() {
                    break;
                }
                match self.status(element, queue_index)? {
                    QueueStatus::Skip => {
                        self.queues[queue_index].skipped += 1;
                        *self.position.get_mut(&element).expect("element is in the plan") += 1;
                    }
                    QueueStatus::Wait => break,
                    QueueStatus::Ready => {
                        if self.queues[queue_index].has_capacity() {
                            self.spawn(element, queue_index)?;
                            dispatched += 1;
                        }
                        break;
                    }
                }
            }
        }
        Ok(dispatched)
    }

    fn has_queue(&self, queue_type: QueueType) -> bool {
        self.queues.iter().any(|queue| queue.queue_type == queue_type)
    }

    fn status(&self, element: usize, queue_index: usize) -> Result<QueueStatus> {
        let state = &self.pipeline.elements[element].state;
        if state.failed {
            return Ok(QueueStatus::Skip);
        }
        Ok(match self.queues[queue_index].queue_type {
            QueueType::Track => {
                if self.pipeline.elements[element]
                    .sources
                    .iter()
                    .any(|source| source.plugin.is_trackable())
                {
                    QueueStatus::Ready
                } else {
                    QueueStatus::Skip
                }
            }
            QueueType::Fetch => match self.pipeline.elements[element].consistency() {
                Consistency::Cached => QueueStatus::Skip,
                Consistency::Resolved => QueueStatus::Ready,
                Consistency::Inconsistent => QueueStatus::Wait,
            },
            QueueType::Pull => {
                if state.cached {
                    QueueStatus::Skip
                } else if !self.pipeline.can_query_cache(element) {
                    QueueStatus::Wait
                } else if self.pipeline.pull_pending(element) {
                    QueueStatus::Ready
                } else {
                    QueueStatus::Skip
                }
            }
            QueueType::Build => {
                // Elements only reach this queue once their pull chance has
                // passed, so a missing artifact here means building.
                if state.cached || state.assemble_done {
                    QueueStatus::Skip
                } else if self.pipeline.buildable(element) {
                    QueueStatus::Ready
                } else {
                    QueueStatus::Wait
                }
            }
            QueueType::Push => {
                if !state.cached {
                    // In a push-only session an uncached element simply has
                    // nothing to offer.
                    if self.has_queue(QueueType::Build) {
                        QueueStatus::Wait
                    } else {
                        QueueStatus::Skip
                    }
                } else if self.pipeline.tainted(element) {
                    // Workspace derived artifacts never propagate.
                    QueueStatus::Skip
                } else {
                    match &state.strong_key {
                        Some(strong) => {
                            let element_ref = &self.pipeline.elements[element];
                            let project =
                                &self.pipeline.projects[element_ref.project].name;
                            if self.pipeline.artifacts.push_needed(
                                project,
                                &element_ref.normal_name,
                                strong,
                            )? {
                                QueueStatus::Ready
                            } else {
                                QueueStatus::Skip
                            }
                        }
                        None => QueueStatus::Skip,
                    }
                }
            }
        })
    }

    fn spawn(&mut self, element: usize, queue_index: usize) -> Result<()> {
        let queue_type = self.queues[queue_index].queue_type;
        trace!(element = %self.pipeline.elements[element].name, %queue_type, "dispatch");
        let tx = self.tx.clone();

        match queue_type {
            QueueType::Track => {
                let sources: Vec<_> = self.pipeline.elements[element]
                    .sources
                    .iter()
                    .map(|source| source.plugin.clone())
                    .collect();
                std::thread::spawn(move || {
                    let outcome = (|| {
                        let mut refs = Vec::with_capacity(sources.len());
                        for source in &sources {
                            refs.push(if source.is_trackable() { source.track()? } else { None });
                        }
                        Ok(JobOutcome::Tracked(refs))
                    })();
                    let _ = tx.send(JobResult { element, queue_index, outcome });
                });
            }
            QueueType::Fetch => {
                let sources: Vec<_> = self.pipeline.elements[element]
                    .sources
                    .iter()
                    .filter(|source| source.consistency != Consistency::Cached)
                    .map(|source| source.plugin.clone())
                    .collect();
                std::thread::spawn(move || {
                    let outcome = (|| {
                        for source in &sources {
                            source.fetch()?;
                        }
                        Ok(JobOutcome::Fetched)
                    })();
                    let _ = tx.send(JobResult { element, queue_index, outcome });
                });
            }
            QueueType::Pull => {
                let artifacts = self.pipeline.artifacts.clone();
                let project =
                    self.pipeline.projects[self.pipeline.elements[element].project].name.clone();
                let normal = self.pipeline.elements[element].normal_name.clone();
                let strict_key = self.pipeline.elements[element].state.strict_key.clone();
                let weak_key = self.pipeline.elements[element].state.weak_key.clone();
                let strict_mode = self.pipeline.context.strict;
                std::thread::spawn(move || {
                    let outcome = (|| {
                        if let Some(strict) = &strict_key {
                            if artifacts.pull(&project, &normal, strict)? {
                                return Ok(JobOutcome::Pulled {
                                    pulled: true,
                                    resolved_strong: Some(strict.clone()),
                                });
                            }
                        }
                        if !strict_mode {
                            if let Some(weak) = &weak_key {
                                if artifacts.pull(&project, &normal, weak)? {
                                    // Learn the strong key the artifact was
                                    // built with and alias its ref.
                                    let meta = artifacts.load_meta(&project, &normal, weak)?;
                                    artifacts.link_key(&project, &normal, weak, &meta.keys.strong)?;
                                    return Ok(JobOutcome::Pulled {
                                        pulled: true,
                                        resolved_strong: Some(meta.keys.strong),
                                    });
                                }
                            }
                        }
                        Ok(JobOutcome::Pulled { pulled: false, resolved_strong: None })
                    })();
                    let _ = tx.send(JobResult { element, queue_index, outcome });
                });
            }
            QueueType::Build => {
                let build = self.build_context(element)?;
                let keys = build.commit_keys.clone();
                // Shield the keys about to be produced from concurrent
                // eviction before the commit lands.
                self.pipeline.artifacts.mark_required(
                    &build.project_name,
                    &build.normal_name,
                    &[keys.strong.clone(), keys.weak.clone()],
                );
                let plugin = self.pipeline.elements[element].plugin.clone();
                let builddir = self.pipeline.context.builddir.clone();
                std::thread::spawn(move || {
                    let outcome = Assembler { build, plugin, builddir }
                        .assemble()
                        .map(|()| JobOutcome::Built(keys));
                    let _ = tx.send(JobResult { element, queue_index, outcome });
                });
            }
            QueueType::Push => {
                let artifacts = self.pipeline.artifacts.clone();
                let project =
                    self.pipeline.projects[self.pipeline.elements[element].project].name.clone();
                let normal = self.pipeline.elements[element].normal_name.clone();
                let state = &self.pipeline.elements[element].state;
                let keys: Vec<String> =
                    [state.strong_key.clone(), state.weak_key.clone()].into_iter().flatten().collect();
                std::thread::spawn(move || {
                    let outcome =
                        artifacts.push(&project, &normal, &keys).map(JobOutcome::Pushed);
                    let _ = tx.send(JobResult { element, queue_index, outcome });
                });
            }
        }

        self.queues[queue_index].active += 1;
        self.active.insert(element);
        Ok(())
    }

    fn build_context(&self, element: usize) -> Result<crate::element::BuildContext> {
        let deps = self.pipeline.staged_dependencies(element)?;
        let commit_keys = self.pipeline.commit_keys(element)?;
        let el = &self.pipeline.elements[element];
        let project = &self.pipeline.projects[el.project];
        let workspaced_dependencies = self
            .pipeline
            .dependencies(element, crate::element::Scope::Build)
            .into_iter()
            .filter(|&dep| self.pipeline.elements[dep].is_workspaced())
            .map(|dep| self.pipeline.elements[dep].name.clone())
            .collect();
        Ok(crate::element::BuildContext {
            element_name: el.name.clone(),
            normal_name: el.normal_name.clone(),
            project_name: project.name.clone(),
            variables: el.variables.clone(),
            environment: el.environment.clone(),
            sources: el.sources.iter().map(|source| source.plugin.clone()).collect(),
            deps,
            split_rules: el.split_rules.clone(),
            public: el.public.clone(),
            fatal_warnings: project.fatal_warnings.clone(),
            commit_keys,
            workspaced: el.is_workspaced(),
            workspaced_dependencies,
            artifacts: self.pipeline.artifacts.clone(),
            logfile: self.pipeline.logfile(element, QueueType::Build.action_name()),
            cancel: self.control.flag(),
        })
    }

    fn apply(&mut self, result: JobResult) -> Result<()> {
        let JobResult { element, queue_index, outcome } = result;
        self.queues[queue_index].active -= 1;
        self.active.remove(&element);
        let name = self.pipeline.elements[element].name.clone();

        match outcome {
            Ok(outcome) => {
                self.queues[queue_index].processed += 1;
                *self.position.get_mut(&element).expect("element is in the plan") += 1;
                match outcome {
                    JobOutcome::Tracked(refs) => {
                        let mut new_refs = Vec::new();
                        for (source, new_ref) in
                            self.pipeline.elements[element].sources.iter().zip(&refs)
                        {
                            if let Some(new_ref) = new_ref {
                                source.plugin.set_ref(new_ref)?;
                                new_refs.push(new_ref.clone());
                            }
                        }
                        if !new_refs.is_empty() {
                            self.results.tracked.push((name.clone(), new_refs));
                        }
                    }
                    JobOutcome::Fetched => self.results.fetched.push(name.clone()),
                    JobOutcome::Pulled { pulled, resolved_strong } => {
                        if pulled {
                            let state = &mut self.pipeline.elements[element].state;
                            if state.strong_key.is_none() {
                                state.strong_key = resolved_strong;
                            }
                            self.results.pulled.push(name.clone());
                        } else {
                            self.pipeline.elements[element].state.pull_failed = true;
                        }
                    }
                    JobOutcome::Built(keys) => {
                        let state = &mut self.pipeline.elements[element].state;
                        state.assemble_done = true;
                        state.assemble_scheduled = false;
                        if state.strong_key.is_none() {
                            state.strong_key = Some(keys.strong.clone());
                        }
                        for source in &self.pipeline.elements[element].sources {
                            source.plugin.mark_built();
                        }
                        let project =
                            self.pipeline.projects[self.pipeline.elements[element].project]
                                .name
                                .clone();
                        let normal = self.pipeline.elements[element].normal_name.clone();
                        self.pipeline.artifacts.mark_required(
                            &project,
                            &normal,
                            &[keys.strong, keys.weak],
                        );
                        self.results.built.push(name.clone());
                    }
                    JobOutcome::Pushed(changed) => {
                        if changed {
                            self.results.pushed.push(name.clone());
                        }
                    }
                }
                self.refresh(element)?;
            }
            Err(err) => {
                let queue_type = self.queues[queue_index].queue_type;

                // Transport failures during pull degrade to a local build.
                if queue_type == QueueType::Pull {
                    warn!(element = %name, %err, "pull failed, falling back to build");
                    self.pipeline.elements[element].state.pull_failed = true;
                    self.queues[queue_index].processed += 1;
                    *self.position.get_mut(&element).expect("element is in the plan") += 1;
                    self.refresh(element)?;
                    return Ok(());
                }

                let attempts = self.attempts.entry((element, queue_index)).or_insert(0);
                if queue_type.retryable() && *attempts < self.pipeline.context.network_retries {
                    *attempts += 1;
                    warn!(element = %name, %err, attempt = *attempts, "retrying after failure");
                    return Ok(());
                }

                error!(element = %name, %err, "job failed");
                error::record_last_error(&err);
                self.queues[queue_index].failed += 1;
                self.results.failed.push(SessionFailure {
                    element: name,
                    message: err.to_string(),
                    domain: err.domain(),
                    reason: err.reason().map(str::to_string),
                });
                self.pipeline.elements[element].state.failed = true;
                if matches!(queue_type, QueueType::Fetch | QueueType::Build) {
                    for dependent in self.pipeline.reverse_closure(element) {
                        self.pipeline.elements[dependent].state.failed = true;
                    }
                }
                match self.pipeline.context.on_error {
                    OnErrorPolicy::Continue => {}
                    OnErrorPolicy::Quit => self.quitting = true,
                    OnErrorPolicy::Terminate => {
                        self.quitting = true;
                        self.results.terminated = true;
                        self.control.terminate();
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-evaluates the element and everything that depends on it.
    fn refresh(&mut self, element: usize) -> Result<()> {
        self.pipeline.update_state(element)?;
        for dependent in self.pipeline.reverse_closure(element) {
            self.pipeline.update_state(dependent)?;
        }
        Ok(())
    }
}
