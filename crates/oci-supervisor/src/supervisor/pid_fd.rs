use std::io;
use std::os::fd::{AsFd, FromRawFd as _, OwnedFd, RawFd};

use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;

/// A process file descriptor, used to await a child's exit on the tokio reactor.
pub(super) struct PidFd {
    fd: OwnedFd,
}

impl PidFd {
    pub(super) fn new(pid: Pid) -> io::Result<Self> {
        use libc::{PIDFD_NONBLOCK, SYS_pidfd_open, syscall};
        let pidfd = unsafe { syscall(SYS_pidfd_open, pid.as_raw(), PIDFD_NONBLOCK) };
        if pidfd == -1 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(pidfd as RawFd) };
        Ok(Self { fd })
    }

    /// Waits for the process to exit and reaps it.
    pub(super) async fn wait(self) -> io::Result<WaitStatus> {
        let fd = AsyncFd::new(self.fd)?;
        loop {
            // readiness is edge triggered, an exit that happened before the
            // AsyncFd was registered would never be reported
            match waitid(
                Id::PIDFd(fd.as_fd()),
                WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG,
            ) {
                Ok(WaitStatus::StillAlive) => {
                    let _ = fd.readable().await?;
                }
                Ok(status) => return Ok(status),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
