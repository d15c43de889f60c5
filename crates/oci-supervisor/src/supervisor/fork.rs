//! Process creation and everything that runs in the forked child.
//!
//! Code that runs in the child must not take locks shared with the parent:
//! the child is single threaded and any lock held by another thread of the
//! parent at fork time stays held forever.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::resource::{Resource, getrlimit};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, close, fork, setpgid};
use oci_spec::runtime::Spec;

use super::stdio::ChildStdio;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::logging::{LogOutput, Severity};
use crate::runtime::{ContainerRuntime, RunOptions, RuntimeEnv};

/// Size of a handshake message on the control pipe.
const HANDSHAKE_LEN: usize = size_of::<i32>();

/// Forks the calling process. The child runs `f` and exits with its result
/// without returning from this function; the parent drops `f` and gets the
/// child's pid.
pub(super) fn fork_child(f: impl FnOnce() -> i32) -> Result<Pid, Errno> {
    // SAFETY: the child only runs `f` and then exits without unwinding
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let code = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(1);
            unsafe { libc::_exit(code) }
        }
    }
}

/// Descriptors open in this process, read from `/proc/self/fd`.
fn open_fds() -> Vec<RawFd> {
    match fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect(),
        Err(_) => {
            let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE).unwrap_or((1024, 1024));
            (0..soft.min(65536) as RawFd).collect()
        }
    }
}

/// Closes every descriptor except stdio and `keep`.
pub(super) fn close_inherited_fds(keep: &[RawFd]) {
    for fd in open_fds() {
        if fd > libc::STDERR_FILENO && !keep.contains(&fd) {
            // the descriptor of the directory listing is already gone
            let _ = close(fd);
        }
    }
}

/// Everything the child needs, prepared by the parent before forking.
pub(super) struct ChildSetup {
    pub stdio: ChildStdio,
    /// Write end of the control pipe
    pub control: OwnedFd,
    /// Write end of the log pipe, if the launch has a log handler
    pub log: Option<OwnedFd>,
    pub verbosity: Severity,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub config: RuntimeConfig,
    pub id: String,
    pub spec: Spec,
    pub opts: RunOptions,
}

impl ChildSetup {
    /// Body of the child process. Returns its exit status.
    pub(super) fn run(self) -> i32 {
        let ChildSetup {
            stdio,
            control,
            log,
            verbosity,
            runtime,
            config,
            id,
            spec,
            opts,
        } = self;

        let mut keep = vec![control.as_raw_fd()];
        keep.extend(log.as_ref().map(AsRawFd::as_raw_fd));

        let mut control = File::from(control);
        let setup = setpgid(Pid::from_raw(0), Pid::from_raw(0)).and_then(|_| stdio.redirect());
        if let Err(errno) = setup {
            let _ = control.write_all(&(errno as i32).to_ne_bytes());
            return 1;
        }
        close_inherited_fds(&keep);

        if control.write_all(&0i32.to_ne_bytes()).is_err() {
            return 1;
        }
        drop(control);

        let log = match log {
            Some(fd) => LogOutput::pipe(fd, verbosity),
            None => LogOutput::stderr(verbosity),
        };
        let env = RuntimeEnv {
            config: &config,
            id: &id,
            log: &log,
        };
        match runtime.run(env, &spec, opts) {
            Ok(code) => code,
            Err(e) => {
                log.error(e.status, e.message);
                1
            }
        }
    }
}

/// Waits for the child's handshake on the read end of the control pipe.
///
/// On failure the child has exited or is about to, and is reaped before
/// returning.
pub(super) fn handshake(pid: Pid, control: OwnedFd) -> Result<()> {
    let mut control = File::from(control);
    let mut buf = [0u8; HANDSHAKE_LEN];
    let res = control.read_exact(&mut buf);
    drop(control);

    let err = match res {
        Ok(()) => match i32::from_ne_bytes(buf) {
            0 => return Ok(()),
            errno => Error::SetupFailed {
                message: "child process setup failed".into(),
                errno: Some(Errno::from_raw(errno)),
            },
        },
        Err(e) => {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                log::debug!("reading the control pipe of child {pid} failed: {e}");
            }
            Error::SetupFailed {
                message: "child process failed unexpectedly".into(),
                errno: None,
            }
        }
    };

    reap(pid);
    Err(err)
}

fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::debug!("cannot reap child {pid}: {e}");
                return;
            }
            Ok(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::wait::WaitStatus;

    use super::*;
    use crate::supervisor::stdio::cloexec_pipe;

    #[test]
    fn test_fork_child_exit_code() -> anyhow::Result<()> {
        let pid = fork_child(|| 42)?;
        assert_eq!(waitpid(pid, None)?, WaitStatus::Exited(pid, 42));
        Ok(())
    }

    #[test]
    fn test_fork_child_panic() -> anyhow::Result<()> {
        let pid = fork_child(|| panic!("boom"))?;
        assert_eq!(waitpid(pid, None)?, WaitStatus::Exited(pid, 1));
        Ok(())
    }

    #[test]
    fn test_handshake_success() -> anyhow::Result<()> {
        let (r, w) = cloexec_pipe()?;
        let pid = fork_child(move || {
            let _ = File::from(w).write_all(&0i32.to_ne_bytes());
            0
        })?;
        handshake(pid, r)?;
        waitpid(pid, None)?;
        Ok(())
    }

    #[test]
    fn test_handshake_errno() -> anyhow::Result<()> {
        let (r, w) = cloexec_pipe()?;
        let pid = fork_child(move || {
            let _ = File::from(w).write_all(&libc::ENOENT.to_ne_bytes());
            1
        })?;
        match handshake(pid, r) {
            Err(Error::SetupFailed { errno, .. }) => assert_eq!(errno, Some(Errno::ENOENT)),
            res => panic!("unexpected result: {res:?}"),
        }
        // already reaped
        assert_eq!(waitpid(pid, None), Err(Errno::ECHILD));
        Ok(())
    }

    #[test]
    fn test_handshake_short_read() -> anyhow::Result<()> {
        let (r, w) = cloexec_pipe()?;
        let pid = fork_child(move || {
            let _ = File::from(w).write_all(&[1, 2]);
            3
        })?;
        match handshake(pid, r) {
            Err(Error::SetupFailed { errno, message }) => {
                assert_eq!(errno, None);
                assert_eq!(message, "child process failed unexpectedly");
            }
            res => panic!("unexpected result: {res:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_close_inherited_fds() -> anyhow::Result<()> {
        let (keep_r, keep_w) = cloexec_pipe()?;
        let (lose_r, lose_w) = cloexec_pipe()?;
        let (keep, lose) = (keep_w.as_raw_fd(), lose_w.as_raw_fd());

        let pid = fork_child(move || {
            close_inherited_fds(&[keep]);
            // EBADF tells the parent the descriptor was closed
            let lost = nix::fcntl::fcntl(lose, nix::fcntl::FcntlArg::F_GETFD) == Err(Errno::EBADF);
            let _ = nix::unistd::write(&keep_w, &[lost as u8]);
            0
        })?;
        drop(lose_w);
        drop(lose_r);

        let mut got = vec![];
        File::from(keep_r).read_to_end(&mut got)?;
        waitpid(pid, None)?;
        assert_eq!(got, vec![1]);
        Ok(())
    }
}
