use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::pid_fd::PidFd;
use super::pump::PumpSet;
use crate::error::{Error, Result};

/// Translates a wait status into the exit code reported to callers:
/// the status of a normal exit, `128 + signal` for a signal death and
/// `-1` for anything else.
pub(crate) fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        status => {
            log::warn!("unexpected wait status: {status:?}");
            -1
        }
    }
}

fn wait_blocking(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            res => return res.map_err(Error::WaitFailed),
        }
    }
}

/// A supervised child process.
///
/// The child must be waited for with [`wait`](ChildHandle::wait) or
/// [`wait_async`](ChildHandle::wait_async). A handle dropped before that reaps
/// the child only if it has already exited.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Pid,
    pumps: Option<PumpSet>,
}

impl ChildHandle {
    pub(crate) fn new(pid: Pid, pumps: PumpSet) -> Self {
        Self {
            pid,
            pumps: Some(pumps),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Sends `signal` to the child's process group, which holds the child and
    /// the container processes that share its group.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        killpg(self.pid, signal).map_err(|e| Error::Io(e.into()))
    }

    /// Blocks until the child has exited and every pump has drained, then
    /// returns the child's exit code.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "Info"))]
    pub fn wait(mut self) -> Result<i32> {
        let status = wait_blocking(self.pid);
        if let Some(pumps) = self.pumps.take() {
            pumps.join();
        }
        let code = exit_code(status?);
        log::debug!("child {} exited with {code}", self.pid);
        Ok(code)
    }

    /// Like [`wait`](ChildHandle::wait), without blocking the async runtime.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "Info"))]
    pub async fn wait_async(mut self) -> Result<i32> {
        let pid = self.pid;
        let pumps = self.pumps.take();

        let status = match PidFd::new(pid) {
            Ok(pidfd) => pidfd.wait().await.map_err(|e| {
                Error::WaitFailed(Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
            }),
            Err(e) => {
                log::debug!("pidfd_open failed, waiting on the blocking pool: {e}");
                tokio::task::spawn_blocking(move || wait_blocking(pid))
                    .await
                    .map_err(|e| Error::Io(std::io::Error::other(e)))
                    .and_then(|res| res)
            }
        };

        if let Some(pumps) = pumps {
            if let Err(e) = tokio::task::spawn_blocking(move || pumps.join()).await {
                log::warn!("failed to join pumps of child {pid}: {e}");
            }
        }

        let code = exit_code(status?);
        log::debug!("child {pid} exited with {code}");
        Ok(code)
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        // pumps are only present until the child has been waited for
        if self.pumps.is_none() {
            return;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                log::warn!("child {} dropped while still running", self.pid)
            }
            Ok(_) => log::warn!("child {} dropped without being waited for", self.pid),
            Err(e) => log::debug!("cannot reap child {}: {e}", self.pid),
        }
    }
}
