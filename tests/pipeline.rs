//! End to end pipeline scenarios, driven through the public session API.

use bst_core::{
    error::ErrorDomain,
    source::{Consistency, SourcePlugin},
    Context, Pipeline, PipelineSelection, PluginRegistry, SessionControl,
};
use pretty_assertions::assert_eq;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct TestProject {
    root: tempfile::TempDir,
}

impl TestProject {
    fn new(project_conf: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("project")).unwrap();
        fs::write(root.path().join("project/project.conf"), project_conf).unwrap();
        Self { root }
    }

    fn write(&self, relpath: &str, content: &str) {
        let path = self.root.path().join("project").join(relpath);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn project_dir(&self) -> PathBuf {
        self.root.path().join("project")
    }

    fn remote_url(&self) -> String {
        format!("file://{}", self.root.path().join("remote").display())
    }

    fn context(&self, cache: &str) -> Context {
        Context::builder()
            .cachedir(self.root.path().join(cache))
            .fetchers(2)
            .builders(2)
            .pushers(2)
            .build()
            .unwrap()
    }

    fn pipeline(&self, context: &Context, targets: &[&str]) -> Pipeline {
        Pipeline::load(context, &self.project_dir(), targets).unwrap()
    }
}

/// A copy-everything manual element body with `/` as the working
/// directory, so commands can address staged dependency files relatively.
fn manual_element(depends: &[&str], install_commands: &[&str]) -> String {
    let mut out = String::from("kind: manual\n");
    if !depends.is_empty() {
        out.push_str("depends:\n");
        for dep in depends {
            out.push_str(&format!("- {dep}\n"));
        }
    }
    out.push_str("variables:\n  build-root: \"/\"\nenvironment:\n  PATH: /usr/bin:/bin\n");
    out.push_str("config:\n  install-commands:\n");
    for command in install_commands {
        out.push_str(&format!("  - {command}\n"));
    }
    out
}

fn import_element(source_path: &str) -> String {
    format!("kind: import\nsources:\n- kind: local\n  path: {source_path}\n")
}

#[test]
fn linear_build_stages_and_caches_the_whole_chain() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    fixture.write("files/base/x", "1");
    fixture.write("base.bst", &import_element("files/base"));
    fixture.write(
        "mid.bst",
        &manual_element(
            &["base.bst"],
            &["cp x \"%{install-root}/x\"", "cp x \"%{install-root}/y\""],
        ),
    );
    fixture.write(
        "top.bst",
        &manual_element(
            &["mid.bst"],
            &[
                "cp x \"%{install-root}/x\"",
                "cp y \"%{install-root}/y\"",
                "cp y \"%{install-root}/z\"",
            ],
        ),
    );

    let context = fixture.context("cache");
    let mut pipeline = fixture.pipeline(&context, &["top.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);
    assert_eq!(results.built.len(), 3);

    for name in ["base.bst", "mid.bst", "top.bst"] {
        let index = pipeline.element_index(name).unwrap();
        assert!(pipeline.element_state(index).cached, "{name} should be cached");
    }

    let top = pipeline.element_index("top.bst").unwrap();
    let checkout = fixture.root.path().join("checkout");
    pipeline.checkout(top, &checkout, true).unwrap();
    assert_eq!(fs::read_to_string(checkout.join("x")).unwrap(), "1");
    assert_eq!(fs::read_to_string(checkout.join("y")).unwrap(), "1");
    assert_eq!(fs::read_to_string(checkout.join("z")).unwrap(), "1");

    // A second session over the same inputs reuses every artifact.
    let mut pipeline = fixture.pipeline(&context, &["top.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success());
    assert!(results.built.is_empty(), "everything should have been cached");
}

#[test]
fn cached_state_is_monotonic_within_a_session() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    fixture.write("files/base/x", "1");
    fixture.write("base.bst", &import_element("files/base"));

    let context = fixture.context("cache");
    let mut pipeline = fixture.pipeline(&context, &["base.bst"]);
    pipeline.build(&SessionControl::new()).unwrap();

    let index = pipeline.element_index("base.bst").unwrap();
    assert!(pipeline.element_state(index).cached);
    assert!(pipeline.element_state(index).assemble_done);
    for _ in 0..3 {
        pipeline.resolve_state().unwrap();
        assert!(pipeline.element_state(index).cached);
        assert!(pipeline.element_state(index).assemble_done);
    }
}

#[test]
fn forbidden_overlap_fails_before_any_command_runs() {
    init_tracing();
    let fixture = TestProject::new("name: demo\nfatal-warnings:\n- overlaps\n");
    fixture.write("files/one/bin/tool", "one");
    fixture.write("files/two/bin/tool", "two");
    fixture.write("base1.bst", &import_element("files/one"));
    fixture.write("base2.bst", &import_element("files/two"));
    fixture.write(
        "top.bst",
        &manual_element(
            &["base1.bst", "base2.bst"],
            &["touch \"%{install-root}/commands-ran\""],
        ),
    );

    let context = fixture.context("cache");
    let mut pipeline = fixture.pipeline(&context, &["top.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();

    let failure = results.failed.iter().find(|f| f.element == "top.bst").expect("top must fail");
    assert_eq!(failure.domain, ErrorDomain::Element);
    assert_eq!(failure.reason.as_deref(), Some("overlap-error"));
    assert!(failure.message.contains("/bin/tool"), "detail: {}", failure.message);

    let top = pipeline.element_index("top.bst").unwrap();
    assert!(!pipeline.element_state(top).cached);
}

#[test]
fn whitelisted_overlap_builds_with_the_later_element_winning() {
    init_tracing();
    let fixture = TestProject::new("name: demo\nfatal-warnings:\n- overlaps\n");
    fixture.write("files/one/bin/tool", "one");
    fixture.write("files/two/bin/tool", "two");
    fixture.write("base1.bst", &import_element("files/one"));
    // base2 stages after base1 (name order) and whitelists its overlap.
    fixture.write(
        "base2.bst",
        &format!(
            "{}public:\n  bst:\n    overlap-whitelist:\n    - \"/bin/*\"\n",
            import_element("files/two")
        ),
    );
    fixture.write(
        "top.bst",
        &manual_element(&["base1.bst", "base2.bst"], &["cp bin/tool \"%{install-root}/tool\""]),
    );

    let context = fixture.context("cache");
    let mut pipeline = fixture.pipeline(&context, &["top.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);

    let top = pipeline.element_index("top.bst").unwrap();
    let checkout = fixture.root.path().join("checkout");
    pipeline.checkout(top, &checkout, true).unwrap();
    assert_eq!(fs::read_to_string(checkout.join("tool")).unwrap(), "two");
}

#[test]
fn integration_commands_run_against_the_staged_sysroot() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    fixture.write("files/base/etc/app.conf", "conf");
    fixture.write(
        "base.bst",
        &format!(
            "{}public:\n  bst:\n    integration-commands:\n    - touch integrated\n",
            import_element("files/base")
        ),
    );
    fixture.write(
        "top.bst",
        &manual_element(&["base.bst"], &["cp integrated \"%{install-root}/integrated\""]),
    );

    let context = fixture.context("cache");
    let mut pipeline = fixture.pipeline(&context, &["top.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);

    let top = pipeline.element_index("top.bst").unwrap();
    let checkout = fixture.root.path().join("checkout");
    pipeline.checkout(top, &checkout, false).unwrap();
    assert!(checkout.join("integrated").is_file());
}

#[test]
fn build_pushes_to_remote_and_nonstrict_pull_learns_the_strong_key() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    fixture.write("files/base/x", "1");
    fixture.write("base.bst", &import_element("files/base"));
    // Configure the remote at the project level.
    let conf = format!("name: demo\nartifacts:\n- url: {}\n  push: true\n", fixture.remote_url());
    fs::write(fixture.project_dir().join("project.conf"), conf).unwrap();

    // First machine: build and push.
    let context = fixture.context("cache-a");
    let mut pipeline = fixture.pipeline(&context, &["base.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);
    assert_eq!(results.pushed, vec!["base.bst".to_string()]);

    let index = pipeline.element_index("base.bst").unwrap();
    let strict_key = pipeline.element_state(index).strict_key.clone().unwrap();
    let weak_key = pipeline.element_state(index).weak_key.clone().unwrap();

    // Drop the strict ref on the remote, leaving only the weak one, as if
    // the artifact had been produced by a non-strict uploader.
    let remote_ref = self::remote_ref_path(fixture.root.path(), "demo", "base", &strict_key);
    fs::remove_file(remote_ref).unwrap();

    // Second machine, non-strict: the weak ref is pulled, the strong key
    // is read from the artifact metadata and aliased locally.
    let context_b = Context::builder()
        .cachedir(fixture.root.path().join("cache-b"))
        .strict(false)
        .build()
        .unwrap();
    let mut pipeline_b = fixture.pipeline(&context_b, &["base.bst"]);
    let results = pipeline_b.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);
    assert_eq!(results.pulled, vec!["base.bst".to_string()]);
    assert!(results.built.is_empty(), "the pulled artifact must be reused");

    let index_b = pipeline_b.element_index("base.bst").unwrap();
    assert_eq!(pipeline_b.element_state(index_b).strong_key.as_deref(), Some(strict_key.as_str()));
    assert!(pipeline_b.artifacts().contains("demo", "base", &weak_key));
    assert!(pipeline_b.artifacts().contains("demo", "base", &strict_key));
}

#[test]
fn termination_interrupts_a_running_build_without_committing() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    fixture.write(
        "slow.bst",
        &manual_element(&[], &["sleep 30", "touch \"%{install-root}/done\""]),
    );

    let context = fixture.context("cache");
    let mut pipeline = fixture.pipeline(&context, &["slow.bst"]);

    let control = SessionControl::new();
    let trigger = control.clone();
    let killer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        trigger.terminate();
    });

    let started = Instant::now();
    let results = pipeline.build(&control).unwrap();
    killer.join().unwrap();

    assert!(results.terminated);
    assert!(started.elapsed() < Duration::from_secs(20));
    let index = pipeline.element_index("slow.bst").unwrap();
    assert!(!pipeline.element_state(index).cached, "no partial artifact may be committed");
}

#[test]
fn cache_keys_are_stable_across_declaration_formatting() {
    init_tracing();
    let make_fixture = |element_yaml: &str| {
        let fixture = TestProject::new("name: demo\n");
        fixture.write("files/base/x", "1");
        fixture.write("app.bst", element_yaml);
        fixture
    };

    // Same logical element, different mapping order and formatting.
    let a = make_fixture(
        "kind: manual\nsources:\n- kind: local\n  path: files/base\nvariables:\n  build-root: \"/\"\nenvironment:\n  PATH: /usr/bin:/bin\n  LANG: C\n",
    );
    let b = make_fixture(
        "environment:\n  LANG:   C\n  PATH: /usr/bin:/bin\nvariables:\n  build-root: \"/\"\nsources:\n- kind: local\n  path: files/base\nkind: manual\n",
    );

    let context_a = a.context("cache");
    let mut pipeline_a = a.pipeline(&context_a, &["app.bst"]);
    pipeline_a.resolve_state().unwrap();
    let context_b = b.context("cache");
    let mut pipeline_b = b.pipeline(&context_b, &["app.bst"]);
    pipeline_b.resolve_state().unwrap();

    let index_a = pipeline_a.element_index("app.bst").unwrap();
    let index_b = pipeline_b.element_index("app.bst").unwrap();
    assert_eq!(
        pipeline_a.element_state(index_a).weak_key,
        pipeline_b.element_state(index_b).weak_key
    );
    assert_eq!(
        pipeline_a.element_state(index_a).strict_key,
        pipeline_b.element_state(index_b).strict_key
    );
}

#[test]
fn staging_order_is_deterministic_and_name_tie_broken() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    fixture.write("zeta.bst", "kind: stack\n");
    fixture.write("alpha.bst", "kind: stack\n");
    fixture.write("app.bst", "kind: stack\ndepends:\n- zeta.bst\n- alpha.bst\n");

    let context = fixture.context("cache");
    let pipeline = fixture.pipeline(&context, &["app.bst"]);
    let app = pipeline.element_index("app.bst").unwrap();
    let order: Vec<&str> = pipeline
        .dependencies(app, bst_core::Scope::All)
        .into_iter()
        .map(|index| pipeline.elements()[index].name.as_str())
        .collect();
    assert_eq!(order, vec!["alpha.bst", "zeta.bst", "app.bst"]);
}

// A tracking source for exercising the track queue: the "symbolic branch"
// is resolved to whatever the config pins as the track target.
#[derive(Debug)]
struct PinnedSource {
    track_target: String,
    current_ref: Mutex<Option<String>>,
}

impl SourcePlugin for PinnedSource {
    fn kind(&self) -> &str {
        "pinned"
    }

    fn unique_key(&self) -> bst_core::Result<Option<serde_json::Value>> {
        Ok(self
            .current_ref
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| serde_json::json!({ "ref": r })))
    }

    fn consistency(&self) -> bst_core::Result<Consistency> {
        Ok(match self.current_ref.lock().unwrap().as_ref() {
            Some(_) => Consistency::Cached,
            None => Consistency::Inconsistent,
        })
    }

    fn get_ref(&self) -> Option<String> {
        self.current_ref.lock().unwrap().clone()
    }

    fn set_ref(&self, new_ref: &str) -> bst_core::Result<()> {
        *self.current_ref.lock().unwrap() = Some(new_ref.to_string());
        Ok(())
    }

    fn is_trackable(&self) -> bool {
        true
    }

    fn track(&self) -> bst_core::Result<Option<String>> {
        Ok(Some(self.track_target.clone()))
    }

    fn stage(&self, directory: &Path) -> bst_core::Result<()> {
        let current = self.current_ref.lock().unwrap().clone().unwrap_or_default();
        fs::write(directory.join("tracked"), current)
            .map_err(|err| bst_core::BstError::source(format!("failed to stage: {err}")))?;
        Ok(())
    }
}

fn pinned_factory(
    _project_dir: &Path,
    config: &serde_yaml::Value,
) -> bst_core::Result<Arc<dyn SourcePlugin>> {
    let target = config
        .get("track")
        .and_then(|v| v.as_str())
        .unwrap_or("main")
        .to_string();
    Ok(Arc::new(PinnedSource { track_target: target, current_ref: Mutex::new(None) }))
}

#[test]
fn tracking_pins_refs_and_unblocks_the_build() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    fixture.write(
        "app.bst",
        "kind: import\nsources:\n- kind: pinned\n  track: v1\n",
    );

    let mut registry = PluginRegistry::with_builtins();
    registry.register_source("pinned", pinned_factory);
    let context = Context::builder()
        .cachedir(fixture.root.path().join("cache"))
        .registry(registry)
        .build()
        .unwrap();

    let mut pipeline = fixture.pipeline(&context, &["app.bst"]);

    // Building an untracked pipeline is refused.
    let err = pipeline.build(&SessionControl::new()).unwrap_err();
    assert_eq!(err.reason(), Some("inconsistent-pipeline"));

    let results = pipeline.track(PipelineSelection::All, &SessionControl::new()).unwrap();
    assert_eq!(results.tracked, vec![("app.bst".to_string(), vec!["v1".to_string()])]);

    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);

    let index = pipeline.element_index("app.bst").unwrap();
    let checkout = fixture.root.path().join("checkout");
    pipeline.checkout(index, &checkout, true).unwrap();
    assert_eq!(fs::read_to_string(checkout.join("tracked")).unwrap(), "v1");
}

#[test]
fn build_logs_are_committed_with_the_artifact() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    fixture.write(
        "noisy.bst",
        &manual_element(&[], &["echo building-noisily", "touch \"%{install-root}/out\""]),
    );

    let context = fixture.context("cache");
    let mut pipeline = fixture.pipeline(&context, &["noisy.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);

    let index = pipeline.element_index("noisy.bst").unwrap();
    let key = pipeline.element_state(index).strong_key.clone().unwrap();
    let extracted = pipeline.artifacts().extract("demo", "noisy", &key).unwrap();
    let log = fs::read_to_string(extracted.join("logs/build.log")).unwrap();
    assert!(log.contains("building-noisily"));

    let meta = pipeline.artifacts().load_meta("demo", "noisy", &key).unwrap();
    assert_eq!(meta.keys.strong, key);
    assert!(!meta.workspaced);
}

fn remote_ref_path(root: &Path, project: &str, element: &str, key: &str) -> PathBuf {
    root.join("remote/refs/heads").join(project).join(element).join(key)
}

#[test]
fn workspaced_builds_are_tainted_and_never_pushed() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    let conf = format!("name: demo\nartifacts:\n- url: {}\n  push: true\n", fixture.remote_url());
    fs::write(fixture.project_dir().join("project.conf"), conf).unwrap();

    fixture.write("files/app/code", "ignored");
    fixture.write(
        "app.bst",
        &manual_element(&[], &["cp code \"%{install-root}/out\""]),
    );
    // Open a workspace for app.bst; its content replaces the sources.
    let workspace = fixture.root.path().join("workspace");
    fs::create_dir_all(&workspace).unwrap();
    fs::write(workspace.join("code"), "workspace edition").unwrap();
    fixture.write(
        ".bst/workspaces.yml",
        &format!("workspaces:\n  app.bst: {}\n", workspace.display()),
    );

    let context = fixture.context("cache");
    let mut pipeline = fixture.pipeline(&context, &["app.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);
    assert_eq!(results.built, vec!["app.bst".to_string()]);
    assert!(results.pushed.is_empty(), "tainted artifacts must not propagate");

    let index = pipeline.element_index("app.bst").unwrap();
    let key = pipeline.element_state(index).strong_key.clone().unwrap();
    let meta = pipeline.artifacts().load_meta("demo", "app", &key).unwrap();
    assert!(meta.workspaced);

    let checkout = fixture.root.path().join("checkout");
    pipeline.checkout(index, &checkout, true).unwrap();
    assert_eq!(fs::read_to_string(checkout.join("out")).unwrap(), "workspace edition");
}

#[test]
fn nonstrict_mode_reuses_dependents_on_weak_key_matches() {
    init_tracing();
    let fixture = TestProject::new("name: demo\n");
    fixture.write("files/base/x", "v1");
    fixture.write("base.bst", &import_element("files/base"));
    fixture.write(
        "app.bst",
        &manual_element(&["base.bst"], &["cp x \"%{install-root}/x\""]),
    );

    // Seed the cache.
    let strict_context = fixture.context("cache");
    let mut pipeline = fixture.pipeline(&strict_context, &["app.bst"]);
    assert_eq!(pipeline.build(&SessionControl::new()).unwrap().built.len(), 2);

    // Change the base element's source content.
    fixture.write("files/base/x", "v2");

    // Non-strict: the dependent's weak key (dependency names only) still
    // matches, so only the changed dependency rebuilds.
    let nonstrict_context = Context::builder()
        .cachedir(fixture.root.path().join("cache"))
        .strict(false)
        .build()
        .unwrap();
    let mut pipeline = fixture.pipeline(&nonstrict_context, &["app.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);
    assert_eq!(results.built, vec!["base.bst".to_string()]);

    // Strict mode rebuilds the dependent as well.
    fixture.write("files/base/x", "v3");
    let mut pipeline = fixture.pipeline(&strict_context, &["app.bst"]);
    let results = pipeline.build(&SessionControl::new()).unwrap();
    assert!(results.is_success(), "failures: {:?}", results.failed);
    assert_eq!(results.built, vec!["base.bst".to_string(), "app.bst".to_string()]);
}
