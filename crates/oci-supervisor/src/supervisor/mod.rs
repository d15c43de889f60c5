//! Runs a container in a forked child process with private I/O streams.
//!
//! A launch goes through these steps:
//! 1. the pipes for the pumped streams, the control pipe and the log pipe are
//!    created, all close-on-exec;
//! 2. with the context locked, the target id is recorded and the child forked;
//! 3. the child becomes the leader of a new process group, installs its
//!    standard streams, closes every other inherited
//!    descriptor and reports the outcome on the control pipe: `0` when it is
//!    ready, an errno when a step failed;
//! 4. the parent starts the pumps and hands back a [`ChildHandle`].
//!
//! The child then runs the container to completion and exits with its status.

mod fork;
mod pid_fd;
pub(crate) mod pump;
pub(crate) mod stdio;
mod wait;

use std::fs::File;
use std::io;

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use self::fork::{ChildSetup, fork_child};
use self::pump::PumpSet;
use self::stdio::{ParentStdio, cloexec_pipe};
pub use self::stdio::{Input, IoConfig, Output};
pub use self::wait::ChildHandle;
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::logging::LogHandler;
use crate::runtime::RunOptions;
use crate::spec::ContainerSpec;

/// Runs container `id` from `spec` in a supervised child process.
///
/// Returns once the child has confirmed its setup. Failures of the setup are
/// reported as [`Error::SetupFailed`] after the child has been reaped; failures
/// of the container itself surface as the exit code returned by
/// [`ChildHandle::wait`].
#[cfg_attr(feature = "tracing", tracing::instrument(skip(ctx, spec, io), level = "Info"))]
pub fn launch_isolated(
    ctx: &RuntimeContext,
    id: &str,
    spec: &ContainerSpec,
    opts: RunOptions,
    mut io: IoConfig,
) -> Result<ChildHandle> {
    let spec = spec.spec()?;
    // the container joins the child's group so that the group can be signalled
    let opts = RunOptions {
        share_process_group: true,
        ..opts
    };
    let handler = io.log.take().or_else(|| ctx.log_handler());
    let verbosity = ctx.log_registry().verbosity();

    let (pid, control, stdio, log_pipe) = ctx.with_target(id, |config, id| {
        let (child_stdio, parent_stdio) = io.split()?;
        let (control_r, control_w) = cloexec_pipe()?;
        let (log_r, log_w) = match handler {
            Some(_) => {
                let (r, w) = cloexec_pipe()?;
                (Some(r), Some(w))
            }
            None => (None, None),
        };

        let setup = ChildSetup {
            stdio: child_stdio,
            control: control_w,
            log: log_w,
            verbosity,
            runtime: ctx.runtime(),
            config: config.clone(),
            id: id.to_string(),
            spec: spec.clone(),
            opts,
        };
        let pid = fork_child(move || setup.run()).map_err(Error::SpawnFailed)?;
        Ok((pid, control_r, parent_stdio, log_r))
    })?;
    log::debug!("forked child {pid} for container {id}");

    fork::handshake(pid, control)?;

    let mut pumps = PumpSet::new();
    let log = log_pipe.map(File::from).zip(handler);
    if let Err(e) = start_pumps(&mut pumps, stdio, log) {
        log::error!("cannot start the pumps of child {pid}: {e}");
        abort_child(pid);
        pumps.join();
        return Err(e.into());
    }

    Ok(ChildHandle::new(pid, pumps))
}

fn start_pumps(
    pumps: &mut PumpSet,
    stdio: ParentStdio,
    log: Option<(File, LogHandler)>,
) -> io::Result<()> {
    if let Some((source, pipe)) = stdio.stdin {
        pumps.input(source, pipe)?;
    }
    if let Some((pipe, sink)) = stdio.stdout {
        pumps.output("stdout", pipe, sink)?;
    }
    if let Some((pipe, sink)) = stdio.stderr {
        pumps.output("stderr", pipe, sink)?;
    }
    if let Some((pipe, handler)) = log {
        pumps.log(pipe, handler)?;
    }
    Ok(())
}

fn abort_child(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    while let Err(nix::errno::Errno::EINTR) = waitpid(pid, None) {}
}
