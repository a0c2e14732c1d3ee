//! The error taxonomy shared by every component.

use once_cell::sync::OnceCell;
use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

pub type Result<T, E = BstError> = std::result::Result<T, E>;

/// The component domain an error originated in.
///
/// Every [`BstError`] maps to exactly one domain; frontends use the domain
/// together with the machine readable reason to decide how to render a
/// failure and with which exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// Malformed input data, missing files, circular dependencies,
    /// unresolved variables.
    Load,
    /// Plugin lookup or configuration failure.
    Plugin,
    /// Source plugin failure (network, ref mismatch, missing host tool).
    Source,
    /// Element assembly failure, missing command, forbidden overlap,
    /// missing artifact.
    Element,
    /// Artifact cache failure (too large, remote unavailable, push failure).
    Artifact,
    /// Sandbox setup or command execution failure.
    Sandbox,
    /// Content addressed store failure (I/O, corruption, missing object).
    Cas,
    /// Top level scheduling failure or workspace misuse.
    Pipeline,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorDomain::Load => "load",
            ErrorDomain::Plugin => "plugin",
            ErrorDomain::Source => "source",
            ErrorDomain::Element => "element",
            ErrorDomain::Artifact => "artifact",
            ErrorDomain::Sandbox => "sandbox",
            ErrorDomain::Cas => "cas",
            ErrorDomain::Pipeline => "pipeline",
        };
        f.write_str(name)
    }
}

/// A failed I/O operation together with the path it failed on.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct BstIoError {
    io: io::Error,
    path: PathBuf,
}

impl BstIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path the operation failed on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn io_error(&self) -> &io::Error {
        &self.io
    }
}

/// The body carried by every domain error: a human message plus the
/// machine readable pieces frontends and tests key on.
#[derive(Debug, Default)]
pub struct ErrorBody {
    pub message: String,
    /// Machine readable reason, e.g. `"overlap-error"`.
    pub reason: Option<String>,
    /// Optional multi line detail rendered below the message.
    pub detail: Option<String>,
    /// Build sandbox left behind for debugging, if any.
    pub sandbox: Option<PathBuf>,
}

impl ErrorBody {
    fn new(message: impl fmt::Display) -> Self {
        Self { message: message.to_string(), ..Default::default() }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "\n{detail}")?;
        }
        Ok(())
    }
}

/// Various error types used throughout the build core.
#[derive(Debug, thiserror::Error)]
pub enum BstError {
    /// Errors related to loading and validating declarative input.
    #[error("{0}")]
    Load(ErrorBody),
    #[error("{0}")]
    Plugin(ErrorBody),
    #[error("{0}")]
    Source(ErrorBody),
    #[error("{0}")]
    Element(ErrorBody),
    #[error("{0}")]
    Artifact(ErrorBody),
    #[error("{0}")]
    Sandbox(ErrorBody),
    #[error("{0}")]
    Cas(ErrorBody),
    #[error("{0}")]
    Pipeline(ErrorBody),
    #[error(transparent)]
    Io(#[from] BstIoError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    SerdeYaml(#[from] serde_yaml::Error),
}

impl BstError {
    pub(crate) fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        BstIoError::new(err, path).into()
    }

    pub fn load(msg: impl fmt::Display) -> Self {
        BstError::Load(ErrorBody::new(msg))
    }

    pub fn plugin(msg: impl fmt::Display) -> Self {
        BstError::Plugin(ErrorBody::new(msg))
    }

    pub fn source(msg: impl fmt::Display) -> Self {
        BstError::Source(ErrorBody::new(msg))
    }

    pub fn element(msg: impl fmt::Display) -> Self {
        BstError::Element(ErrorBody::new(msg))
    }

    pub fn artifact(msg: impl fmt::Display) -> Self {
        BstError::Artifact(ErrorBody::new(msg))
    }

    pub fn sandbox(msg: impl fmt::Display) -> Self {
        BstError::Sandbox(ErrorBody::new(msg))
    }

    pub fn cas(msg: impl fmt::Display) -> Self {
        BstError::Cas(ErrorBody::new(msg))
    }

    pub fn pipeline(msg: impl fmt::Display) -> Self {
        BstError::Pipeline(ErrorBody::new(msg))
    }

    /// Attaches a machine readable reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        if let Some(body) = self.body_mut() {
            body.reason = Some(reason.into());
        }
        self
    }

    /// Attaches multi line detail to the error message.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        if let Some(body) = self.body_mut() {
            body.detail = Some(detail.into());
        }
        self
    }

    /// Records the sandbox directory left behind for debugging.
    pub fn with_sandbox(mut self, path: impl Into<PathBuf>) -> Self {
        if let Some(body) = self.body_mut() {
            body.sandbox = Some(path.into());
        }
        self
    }

    pub fn domain(&self) -> ErrorDomain {
        match self {
            BstError::Load(_) | BstError::SerdeYaml(_) => ErrorDomain::Load,
            BstError::Plugin(_) => ErrorDomain::Plugin,
            BstError::Source(_) => ErrorDomain::Source,
            BstError::Element(_) => ErrorDomain::Element,
            BstError::Artifact(_) => ErrorDomain::Artifact,
            BstError::Sandbox(_) => ErrorDomain::Sandbox,
            BstError::Cas(_) | BstError::Io(_) | BstError::SerdeJson(_) => ErrorDomain::Cas,
            BstError::Pipeline(_) => ErrorDomain::Pipeline,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        self.body().and_then(|body| body.reason.as_deref())
    }

    pub fn detail(&self) -> Option<&str> {
        self.body().and_then(|body| body.detail.as_deref())
    }

    fn body(&self) -> Option<&ErrorBody> {
        match self {
            BstError::Load(body)
            | BstError::Plugin(body)
            | BstError::Source(body)
            | BstError::Element(body)
            | BstError::Artifact(body)
            | BstError::Sandbox(body)
            | BstError::Cas(body)
            | BstError::Pipeline(body) => Some(body),
            _ => None,
        }
    }

    fn body_mut(&mut self) -> Option<&mut ErrorBody> {
        match self {
            BstError::Load(body)
            | BstError::Plugin(body)
            | BstError::Source(body)
            | BstError::Element(body)
            | BstError::Artifact(body)
            | BstError::Sandbox(body)
            | BstError::Cas(body)
            | BstError::Pipeline(body) => Some(body),
            _ => None,
        }
    }
}

/// The `(domain, reason)` pair of the first unrecovered error of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastError {
    pub domain: ErrorDomain,
    pub reason: Option<String>,
}

static LAST_ERROR: OnceCell<Mutex<Option<LastError>>> = OnceCell::new();

/// Enables recording of the first unrecovered session error.
///
/// This exists for test harnesses that want to assert on the `(domain,
/// reason)` of a failure without parsing rendered messages; production code
/// paths never read it.
pub fn track_last_error() {
    let _ = LAST_ERROR.set(Mutex::new(None));
}

pub(crate) fn record_last_error(err: &BstError) {
    if let Some(cell) = LAST_ERROR.get() {
        let mut slot = cell.lock().unwrap();
        if slot.is_none() {
            *slot = Some(LastError {
                domain: err.domain(),
                reason: err.reason().map(str::to_string),
            });
        }
    }
}

/// Takes the recorded last error, resetting the slot.
///
/// Returns `None` when tracking was never enabled or nothing failed since
/// the last call.
pub fn take_last_error() -> Option<LastError> {
    LAST_ERROR.get().and_then(|cell| cell.lock().unwrap().take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_and_detail_attach_to_domain_errors() {
        let err = BstError::element("forbidden overlaps")
            .with_reason("overlap-error")
            .with_detail("  /bin/tool: base above overlay");
        assert_eq!(err.domain(), ErrorDomain::Element);
        assert_eq!(err.reason(), Some("overlap-error"));
        assert!(err.to_string().contains("/bin/tool"));
    }

    #[test]
    fn io_errors_map_to_cas_domain() {
        let err = BstError::io(io::Error::new(io::ErrorKind::NotFound, "gone"), "/some/file");
        assert_eq!(err.domain(), ErrorDomain::Cas);
        assert!(err.to_string().contains("/some/file"));
    }

    #[test]
    fn last_error_slot_records_first_failure_only() {
        track_last_error();
        record_last_error(&BstError::artifact("too large").with_reason("cache-too-full"));
        record_last_error(&BstError::load("second"));
        let last = take_last_error().unwrap();
        assert_eq!(last.domain, ErrorDomain::Artifact);
        assert_eq!(last.reason.as_deref(), Some("cache-too-full"));
        assert_eq!(take_last_error(), None);
    }
}
