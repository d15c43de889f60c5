//! Diagnostics emitted by the container runtime.
//!
//! Records are delivered to a [`LogHandler`]. When the runtime runs inside a supervised
//! child process the records travel over a pipe using the format in [`channel`].

pub mod channel;
pub(crate) mod output;
pub mod registry;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

pub use output::LogOutput;
pub use registry::{HandlerToken, LogRegistry};

/// Severity of a runtime diagnostic, ordered from least to most verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i32)]
pub enum Severity {
    #[default]
    Error = 0,
    Warning = 1,
    Debug = 2,
}

impl Severity {
    /// Decodes a wire value. Values above the known range are more verbose
    /// than debug and are reported as [`Severity::Debug`].
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            i32::MIN..=0 => Severity::Error,
            1 => Severity::Warning,
            _ => Severity::Debug,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Debug => "debug",
        };
        f.write_str(s)
    }
}

/// A single diagnostic record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// System errno if applicable, 0 otherwise
    pub errno: i32,
    pub message: String,
    pub severity: Severity,
}

impl LogEntry {
    pub fn new(severity: Severity, errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
            severity,
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.errno != 0 {
            write!(f, ": {}", nix::errno::Errno::from_raw(self.errno).desc())?;
        }
        Ok(())
    }
}

type HandlerFn = Box<dyn FnMut(LogEntry) + Send>;

/// Receives [`LogEntry`] records.
///
/// Cloning is cheap and all clones share the same callback. The callback is
/// invoked synchronously and never for two entries at the same time, even when
/// several launches deliver records concurrently. It should be fast; hand
/// expensive work to a channel.
#[derive(Clone)]
pub struct LogHandler {
    inner: Arc<Mutex<HandlerFn>>,
}

impl LogHandler {
    pub fn new(f: impl FnMut(LogEntry) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(f))),
        }
    }

    /// A handler that re-emits every record through the `log` facade.
    pub fn forward_to_log() -> Self {
        Self::new(|entry: LogEntry| match entry.severity {
            Severity::Error => log::error!(target: "oci_supervisor::runtime", "{entry}"),
            Severity::Warning => log::warn!(target: "oci_supervisor::runtime", "{entry}"),
            Severity::Debug => log::debug!(target: "oci_supervisor::runtime", "{entry}"),
        })
    }

    pub fn handle(&self, entry: LogEntry) {
        // a handler that panicked once is still usable for the next record
        let mut f = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(entry)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LogHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Error < Severity::Warning);
        assert!(Severity::Warning < Severity::Debug);
        assert_eq!(Severity::default(), Severity::Error);
    }

    #[test]
    fn test_severity_raw() {
        assert_eq!(Severity::from_raw(0), Severity::Error);
        assert_eq!(Severity::from_raw(1), Severity::Warning);
        assert_eq!(Severity::from_raw(2), Severity::Debug);
        assert_eq!(Severity::from_raw(7), Severity::Debug);
        assert_eq!(Severity::from_raw(-1), Severity::Error);
        assert_eq!(Severity::Warning.as_raw(), 1);
    }

    #[test]
    fn test_entry_display() {
        let e = LogEntry::new(Severity::Error, 0, "mount failed");
        assert_eq!(e.to_string(), "mount failed");
        let e = LogEntry::new(Severity::Error, libc::EPERM, "mount failed");
        assert_eq!(e.to_string(), "mount failed: Operation not permitted");
    }

    #[test]
    fn test_handler_clones_share_callback() {
        let (tx, rx) = channel();
        let handler = LogHandler::new(move |e| tx.send(e).unwrap());
        let other = handler.clone();
        assert!(handler.ptr_eq(&other));

        handler.handle(LogEntry::new(Severity::Debug, 0, "one"));
        other.handle(LogEntry::new(Severity::Warning, 0, "two"));

        let got: Vec<_> = rx.try_iter().map(|e| e.message).collect();
        assert_eq!(got, vec!["one", "two"]);
    }

    #[test]
    fn test_handler_survives_panic() {
        let (tx, rx) = channel();
        let handler = LogHandler::new(move |e: LogEntry| {
            if e.message == "boom" {
                panic!("boom");
            }
            tx.send(e).unwrap();
        });

        let h = handler.clone();
        let res = std::thread::spawn(move || h.handle(LogEntry::new(Severity::Error, 0, "boom")))
            .join();
        assert!(res.is_err());

        handler.handle(LogEntry::new(Severity::Error, 0, "after"));
        assert_eq!(rx.recv().unwrap().message, "after");
    }
}
