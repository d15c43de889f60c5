use std::fs::File;
use std::io::stderr;
use std::os::fd::{AsFd, OwnedFd};

use super::{LogEntry, LogHandler, Severity, channel};

/// Where a [`ContainerRuntime`](crate::runtime::ContainerRuntime) sends its diagnostics.
///
/// All writes are best effort. A producer running in a freshly forked child has no
/// way left to report a failed write, so failures are dropped.
#[derive(Debug)]
pub enum LogOutput {
    /// Deliver records in-process to a handler.
    Handler {
        handler: LogHandler,
        verbosity: Severity,
    },
    /// Encode records onto the log pipe of a supervised child.
    Pipe { pipe: File, verbosity: Severity },
    /// Write records as text to the standard error descriptor.
    Stderr { verbosity: Severity },
}

impl LogOutput {
    pub fn handler(handler: LogHandler, verbosity: Severity) -> Self {
        LogOutput::Handler { handler, verbosity }
    }

    pub fn pipe(fd: impl Into<OwnedFd>, verbosity: Severity) -> Self {
        LogOutput::Pipe {
            pipe: File::from(fd.into()),
            verbosity,
        }
    }

    pub fn stderr(verbosity: Severity) -> Self {
        LogOutput::Stderr { verbosity }
    }

    pub fn verbosity(&self) -> Severity {
        match self {
            LogOutput::Handler { verbosity, .. }
            | LogOutput::Pipe { verbosity, .. }
            | LogOutput::Stderr { verbosity } => *verbosity,
        }
    }

    pub fn enabled(&self, severity: Severity) -> bool {
        severity <= self.verbosity()
    }

    pub fn emit(&self, entry: LogEntry) {
        if !self.enabled(entry.severity) {
            return;
        }
        match self {
            LogOutput::Handler { handler, .. } => handler.handle(entry),
            LogOutput::Pipe { pipe, .. } => {
                let _ = channel::write_entry(pipe, &entry);
            }
            LogOutput::Stderr { .. } => {
                // bypass the std lock, it may be held by a thread that no longer
                // exists in this process
                let line = format!("{}: {entry}\n", entry.severity);
                let _ = nix::unistd::write(stderr().as_fd(), line.as_bytes());
            }
        }
    }

    pub fn error(&self, errno: i32, message: impl Into<String>) {
        self.emit(LogEntry::new(Severity::Error, errno, message))
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(LogEntry::new(Severity::Warning, 0, message))
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(LogEntry::new(Severity::Debug, 0, message))
    }
}
