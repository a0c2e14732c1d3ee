//! The execution environment build commands run in.
//!
//! Element plugins drive a sandbox through three phases: configuration
//! (marking directories, environment), staging (importing dependency
//! artifacts and sources) and assembly (running commands, naming the output
//! directory). The [`Sandbox`] trait is the seam; [`HostSandbox`] is the
//! built-in runner which executes commands directly on the host against the
//! staged root.

use crate::error::{BstError, Result};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    ops::BitOr,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

mod overlap;
pub use overlap::{OverlapCollector, OverlapOutcome, OverlapPolicy};

/// Flags indicating how a sandbox command should be run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SandboxFlags(u32);

impl SandboxFlags {
    pub const NONE: Self = Self(0);
    /// The root filesystem is read only. Normally set except when running
    /// integration commands, which must update caches below the root.
    pub const ROOT_READ_ONLY: Self = Self(0x01);
    /// Expose the host network to the command.
    pub const NETWORK_ENABLED: Self = Self(0x02);
    /// Run interactively, inheriting the caller's stdio.
    pub const INTERACTIVE: Self = Self(0x04);
    /// Run with the caller's uid instead of a sandbox uid.
    pub const INHERIT_UID: Self = Self(0x08);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SandboxFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A directory the element asked to have exposed read-write.
#[derive(Clone, Debug)]
pub struct MarkedDirectory {
    /// Absolute in-sandbox path.
    pub path: String,
    /// Whether the directory will be collected as artifact output.
    pub artifact: bool,
}

/// The contract element plugins program against.
pub trait Sandbox: Send {
    /// The staging root on the host filesystem.
    fn root(&self) -> &Path;

    /// Declares a read-write directory inside the sandbox, creating it.
    fn mark_directory(&mut self, path: &str, artifact: bool) -> Result<()>;

    /// The directories marked so far.
    fn marked_directories(&self) -> &[MarkedDirectory];

    /// Replaces the sandbox environment.
    fn set_environment(&mut self, env: BTreeMap<String, String>);

    /// The current sandbox environment.
    fn environment(&self) -> &BTreeMap<String, String>;

    /// Sets the default working directory for commands.
    fn set_work_directory(&mut self, cwd: &str);

    /// Runs a command, returning its exit code.
    ///
    /// `cwd` and `env` override the configured defaults for this one
    /// invocation. A failure to launch is an error; a non-zero exit code is
    /// not, the caller decides what it means.
    fn run(
        &mut self,
        command: &[String],
        flags: SandboxFlags,
        cwd: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<i32>;
}

/// Runs commands directly on the host against the staged root.
///
/// Isolation flags are advisory here: there is no mount namespace, so
/// `ROOT_READ_ONLY` and `NETWORK_ENABLED` cannot be enforced. Frontends
/// needing real confinement provide their own [`Sandbox`] implementation;
/// everything above the `run` seam behaves identically.
#[derive(Debug)]
pub struct HostSandbox {
    root: PathBuf,
    environment: BTreeMap<String, String>,
    work_directory: Option<String>,
    marked: Vec<MarkedDirectory>,
    log_path: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl HostSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| BstError::io(err, &root))?;
        Ok(Self {
            root,
            environment: BTreeMap::new(),
            work_directory: None,
            marked: Vec::new(),
            log_path: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Captures command output into the given log file.
    pub fn with_log(mut self, log_path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(log_path.into());
        self
    }

    /// Shares a cancellation token; a set token terminates the running
    /// child process.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn host_path(&self, sandbox_path: &str) -> PathBuf {
        let mut path = self.root.clone();
        for component in sandbox_path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            path.push(component);
        }
        path
    }

    /// Maps marked directory paths inside command text to their host
    /// locations.
    ///
    /// Element commands address marked directories by their in-sandbox
    /// paths (`/buildstream/install` and friends). A confined sandbox
    /// resolves those natively; the host runner substitutes the staging
    /// root prefix instead. Only marked directories are mapped, never
    /// arbitrary absolute paths.
    fn map_marked_paths(&self, text: &str) -> String {
        let mut mapped = text.to_string();
        let mut paths: Vec<&str> = self
            .marked
            .iter()
            .map(|m| m.path.as_str())
            // A mark on the root itself cannot be mapped textually.
            .filter(|path| path.split('/').any(|c| !c.is_empty() && c != "."))
            .collect();
        // Longest prefix first so nested marks resolve correctly.
        paths.sort_by_key(|path| std::cmp::Reverse(path.len()));
        for path in paths {
            if mapped.contains(path) {
                mapped = mapped.replace(path, &self.host_path(path).to_string_lossy());
            }
        }
        mapped
    }

    fn append_log(&self, line: &str) {
        if let Some(log_path) = &self.log_path {
            if let Ok(mut file) =
                fs::OpenOptions::new().create(true).append(true).open(log_path)
            {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

impl Sandbox for HostSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    fn mark_directory(&mut self, path: &str, artifact: bool) -> Result<()> {
        let host = self.host_path(path);
        fs::create_dir_all(&host).map_err(|err| BstError::io(err, &host))?;
        self.marked.push(MarkedDirectory { path: path.to_string(), artifact });
        Ok(())
    }

    fn marked_directories(&self) -> &[MarkedDirectory] {
        &self.marked
    }

    fn set_environment(&mut self, env: BTreeMap<String, String>) {
        self.environment = env;
    }

    fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    fn set_work_directory(&mut self, cwd: &str) {
        self.work_directory = Some(cwd.to_string());
    }

    fn run(
        &mut self,
        command: &[String],
        flags: SandboxFlags,
        cwd: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<i32> {
        let command: Vec<String> =
            command.iter().map(|part| self.map_marked_paths(part)).collect();
        let (program, args) = command.split_first().ok_or_else(|| {
            BstError::sandbox("refusing to run an empty command").with_reason("missing-command")
        })?;

        let cwd = cwd
            .map(str::to_string)
            .or_else(|| self.work_directory.clone())
            .unwrap_or_else(|| "/".to_string());
        let host_cwd = self.host_path(&cwd);
        fs::create_dir_all(&host_cwd).map_err(|err| BstError::io(err, &host_cwd))?;

        let environment = env.unwrap_or(&self.environment);

        self.append_log(&format!("+ {}", command.join(" ")));

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&host_cwd).env_clear().envs(environment);
        if flags.contains(SandboxFlags::INTERACTIVE) {
            cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else if let Some(log_path) = &self.log_path {
            let log = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(|err| BstError::io(err, log_path))?;
            let log_err = log.try_clone().map_err(|err| BstError::io(err, log_path))?;
            cmd.stdin(Stdio::null()).stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        } else {
            cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|err| {
            BstError::sandbox(format!("failed to run {program:?}: {err}"))
                .with_reason("missing-command")
        })?;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BstError::sandbox(format!("command {program:?} was terminated"))
                    .with_reason("terminated"));
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(-1);
                    self.append_log(&format!("exit {code}"));
                    return Ok(code);
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(err) => return Err(BstError::io(err, &self.root)),
            }
        }
    }
}
