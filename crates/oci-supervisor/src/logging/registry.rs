//! A single-slot registration point for the log handler.
//!
//! Installing a handler replaces the previous one. The token returned for the
//! replaced handler becomes stale: releasing it later is a no-op and never
//! removes the handler that replaced it.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use super::{LogHandler, Severity};

static GLOBAL: LazyLock<Arc<LogRegistry>> = LazyLock::new(|| Arc::new(LogRegistry::new()));

/// Identifies one installation of a handler in a [`LogRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "the handler stays installed until its token is released"]
pub struct HandlerToken(u64);

#[derive(Debug)]
pub struct LogRegistry {
    slot: Mutex<Option<(HandlerToken, LogHandler)>>,
    next: AtomicU64,
    verbosity: AtomicI32,
}

impl Default for LogRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRegistry {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next: AtomicU64::new(1),
            verbosity: AtomicI32::new(Severity::Error.as_raw()),
        }
    }

    /// The process-wide registry used by contexts that are not given their own.
    pub fn global() -> Arc<LogRegistry> {
        GLOBAL.clone()
    }

    /// Installs `handler`, replacing and orphaning any previous one.
    pub fn install(&self, handler: LogHandler) -> HandlerToken {
        let token = HandlerToken(self.next.fetch_add(1, Ordering::Relaxed));
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((old, _)) = slot.replace((token, handler)) {
            log::debug!("log handler {old:?} replaced by {token:?}");
        }
        token
    }

    /// Removes the handler installed with `token`.
    /// Returns false if that handler was already released or replaced.
    pub fn release(&self, token: HandlerToken) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match *slot {
            Some((current, _)) if current == token => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Removes whatever handler is installed.
    pub fn reset(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_current(&self, token: HandlerToken) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(*slot, Some((current, _)) if current == token)
    }

    pub fn current(&self) -> Option<LogHandler> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map(|(_, handler)| handler.clone())
    }

    /// Records more verbose than this are dropped by the runtime before they are sent.
    pub fn set_verbosity(&self, verbosity: Severity) {
        self.verbosity.store(verbosity.as_raw(), Ordering::Relaxed);
    }

    pub fn verbosity(&self) -> Severity {
        Severity::from_raw(self.verbosity.load(Ordering::Relaxed))
    }
}
