//! Error types used by the supervisor.
//! Failures reported by the container runtime are classified exactly once, when they
//! are converted into a [`ContainerError`]; everything above that passes them through.

use std::fmt;

use nix::errno::Errno;
use oci_spec::OciSpecError;
use thiserror::Error;

/// The closed set of error kinds a caller can match on.
///
/// The first seven are produced by [`classify`]; the remaining ones are raised by the
/// supervisor itself and never go through the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidSpec,
    PermissionDenied,
    ContainerRunning,
    ContainerNotRunning,
    Unknown,
    InvalidArgument,
    SpawnFailed,
    SetupFailed,
    WaitFailed,
}

/// Maps a runtime diagnostic plus its numeric status onto an [`ErrorKind`].
///
/// Rules are checked in a fixed order and the first match wins, so that
/// "container is not running" is never reported as [`ErrorKind::ContainerRunning`].
pub fn classify(message: &str, status: i32) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("does not exist") {
        ErrorKind::NotFound
    } else if lower.contains("already exists") {
        ErrorKind::AlreadyExists
    } else if lower.contains("invalid") || lower.contains("parse") {
        ErrorKind::InvalidSpec
    } else if lower.contains("permission") || status == libc::EPERM || status == libc::EACCES {
        ErrorKind::PermissionDenied
    } else if lower.contains("not running") {
        ErrorKind::ContainerNotRunning
    } else if lower.contains("running") {
        ErrorKind::ContainerRunning
    } else {
        ErrorKind::Unknown
    }
}

/// A raw failure as reported by a [`ContainerRuntime`](crate::runtime::ContainerRuntime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    /// System errno, 0 when the failure is not tied to one.
    pub status: i32,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, status: i32) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }

    pub fn from_errno(message: impl Into<String>, errno: Errno) -> Self {
        Self::new(message, errno as i32)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            0 => write!(f, "{}", self.message),
            status => write!(f, "{}: {}", self.message, Errno::from_raw(status).desc()),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        let status = err.raw_os_error().unwrap_or_default();
        Self::new(err.to_string(), status)
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("cannot parse state: {err}"), 0)
    }
}

/// A classified runtime failure. It keeps the raw message and status for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source}")]
pub struct ContainerError {
    pub kind: ErrorKind,
    #[source]
    pub source: RuntimeError,
}

impl ContainerError {
    pub fn message(&self) -> &str {
        &self.source.message
    }

    pub fn status(&self) -> i32 {
        self.source.status
    }
}

impl From<RuntimeError> for ContainerError {
    fn from(source: RuntimeError) -> Self {
        let kind = classify(&source.message, source.status);
        Self { kind, source }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// A failure reported by the container runtime, already classified
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// A handle was released or an argument was unusable; no work was attempted
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The child process could not be created
    #[error("failed to spawn child process: {0}")]
    SpawnFailed(#[source] Errno),
    /// The child process failed before handing control to the runtime
    #[error("{message}{}", .errno.map(|e| format!(": {}", e.desc())).unwrap_or_default())]
    SetupFailed {
        message: String,
        errno: Option<Errno>,
    },
    /// Waiting for the child process failed
    #[error("waitpid failed: {0}")]
    WaitFailed(#[source] Errno),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Oci(#[from] OciSpecError),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        Error::Container(err.into())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Container(e) => e.kind,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Error::SetupFailed { .. } => ErrorKind::SetupFailed,
            Error::WaitFailed(_) => ErrorKind::WaitFailed,
            Error::Io(_) | Error::Json(_) | Error::Oci(_) => ErrorKind::Unknown,
        }
    }

    pub(crate) fn invalid_context() -> Self {
        Error::InvalidArgument("invalid runtime context".into())
    }
}
