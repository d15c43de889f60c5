//! A runtime that starts the container process directly on the host.

use std::fmt::Display;
use std::fs;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;

use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgid};
use oci_spec::runtime::{LinuxResources, Process, Spec};

use super::{ContainerRuntime, CreateOptions, RunOptions, RuntimeEnv, procfs};
use crate::container::{ContainerState, ContainerStatus};
use crate::error::RuntimeError;

const STATE_FILE: &str = "state.json";
const CONFIG_FILE: &str = "config.json";

/// A [`ContainerRuntime`] without any isolation.
///
/// The container's process is spawned as a new process group on the host, unless
/// [`RunOptions::share_process_group`] asks to keep the caller's. Namespaces,
/// mounts, cgroups and the process user are ignored. State is kept in
/// `<state_root>/<id>/state.json` next to the saved `config.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRuntime;

fn io_error(context: impl Display, err: io::Error) -> RuntimeError {
    match err.raw_os_error() {
        Some(errno) => RuntimeError::new(context.to_string(), errno),
        None => RuntimeError::new(format!("{context}: {err}"), 0),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn command(process: &Process, new_group: bool) -> Result<Command, RuntimeError> {
    let args = process.args().as_deref().unwrap_or_default();
    let Some((program, args)) = args.split_first() else {
        return Err(RuntimeError::from_errno(
            "invalid process: args must not be empty",
            Errno::EINVAL,
        ));
    };

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(process.cwd());
    if new_group {
        cmd.process_group(0);
    }
    if let Some(vars) = process.env() {
        cmd.env_clear();
        cmd.envs(vars.iter().filter_map(|var| var.split_once('=')));
    }
    Ok(cmd)
}

/// Signals the process group of `pid`, which need not be its leader.
fn signal_group(pid: Pid, signal: Signal) -> Result<(), Errno> {
    killpg(getpgid(Some(pid))?, signal)
}

fn reap(mut child: Child) {
    thread::spawn(move || {
        let _ = child.wait();
    });
}

/// The state directory of one container.
struct StateDir<'a> {
    id: &'a str,
    path: PathBuf,
}

impl<'a> StateDir<'a> {
    fn new(env: RuntimeEnv<'a>) -> Result<Self, RuntimeError> {
        let id = env.id;
        if id.is_empty() || id == "." || id == ".." || id.contains('/') {
            return Err(RuntimeError::from_errno(
                format!("invalid container id `{id}`"),
                Errno::EINVAL,
            ));
        }
        Ok(Self {
            id,
            path: env.config.state_root.join(id),
        })
    }

    fn exists(&self) -> bool {
        self.path.join(STATE_FILE).exists()
    }

    /// Loads the recorded state and marks it stopped if its process is gone.
    fn load(&self) -> Result<ContainerState, RuntimeError> {
        let file = self.path.join(STATE_FILE);
        let data = match fs::read(&file) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RuntimeError::from_errno(
                    format!("container `{}` does not exist", self.id),
                    Errno::ENOENT,
                ));
            }
            Err(e) => return Err(io_error(format_args!("read `{}`", file.display()), e)),
        };

        let mut state: ContainerState = serde_json::from_slice(&data)?;
        let started = matches!(
            state.status,
            ContainerStatus::Running | ContainerStatus::Paused
        );
        if started && !procfs::is_alive(state.pid) {
            state.status = ContainerStatus::Stopped;
        }
        Ok(state)
    }

    fn save(&self, state: &ContainerState) -> Result<(), RuntimeError> {
        let file = self.path.join(STATE_FILE);
        let data = serde_json::to_vec(state)?;
        fs::write(&file, data).map_err(|e| io_error(format_args!("write `{}`", file.display()), e))
    }

    fn update(&self, f: impl FnOnce(&mut ContainerState)) -> Result<(), RuntimeError> {
        let mut state = self.load()?;
        f(&mut state);
        self.save(&state)
    }

    fn remove(&self) -> Result<(), RuntimeError> {
        fs::remove_dir_all(&self.path)
            .map_err(|e| io_error(format_args!("remove `{}`", self.path.display()), e))
    }

    fn not_running(&self) -> RuntimeError {
        RuntimeError::from_errno(format!("container `{}` is not running", self.id), Errno::ESRCH)
    }

    /// The pid of the container's process if it has one that is still alive.
    fn live_pid(&self) -> Result<(ContainerState, Pid), RuntimeError> {
        let state = self.load()?;
        match state.status {
            ContainerStatus::Running | ContainerStatus::Paused => {
                let pid = Pid::from_raw(state.pid);
                Ok((state, pid))
            }
            _ => Err(self.not_running()),
        }
    }
}

impl HostRuntime {
    pub fn new() -> Self {
        Self
    }

    /// Spawns the container's process and records it as the running container process.
    fn spawn(
        &self,
        dir: &StateDir,
        spec: &Spec,
        stdin: Stdio,
        new_group: bool,
    ) -> Result<Child, RuntimeError> {
        let Some(process) = spec.process() else {
            return Err(RuntimeError::from_errno(
                "invalid spec: no process to run",
                Errno::EINVAL,
            ));
        };

        let mut cmd = command(process, new_group)?;
        cmd.stdin(stdin);
        let mut child = cmd
            .spawn()
            .map_err(|e| io_error(format_args!("exec `{:?}`", cmd.get_program()), e))?;

        let pid = child.id() as i32;
        if let Err(e) = dir.update(|state| {
            state.status = ContainerStatus::Running;
            state.pid = pid;
        }) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        Ok(child)
    }
}

impl ContainerRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn create(&self, env: RuntimeEnv, spec: &Spec, opts: CreateOptions) -> Result<(), RuntimeError> {
        let dir = StateDir::new(env)?;
        if dir.exists() {
            return Err(RuntimeError::from_errno(
                format!("container `{}` already exists", env.id),
                Errno::EEXIST,
            ));
        }
        fs::create_dir_all(&dir.path)
            .map_err(|e| io_error(format_args!("create `{}`", dir.path.display()), e))?;

        let config = dir.path.join(CONFIG_FILE);
        spec.save(&config)
            .map_err(|e| RuntimeError::new(format!("cannot save `{}`: {e}", config.display()), 0))?;

        if opts.preserve_fds > 0 {
            env.log
                .debug("descriptors without close-on-exec are inherited by the container process");
        }

        dir.save(&ContainerState {
            oci_version: spec.version().clone(),
            id: env.id.to_string(),
            status: ContainerStatus::Created,
            pid: 0,
            bundle: env.config.bundle.clone(),
            annotations: spec.annotations().clone(),
            created: Some(Utc::now()),
        })?;
        env.log.debug(format!("created container `{}`", env.id));
        Ok(())
    }

    fn start(&self, env: RuntimeEnv) -> Result<(), RuntimeError> {
        let dir = StateDir::new(env)?;
        let state = dir.load()?;
        match state.status {
            ContainerStatus::Created => {}
            ContainerStatus::Running | ContainerStatus::Paused => {
                return Err(RuntimeError::from_errno(
                    format!("container `{}` is already running", env.id),
                    Errno::EBUSY,
                ));
            }
            status => {
                return Err(RuntimeError::new(
                    format!("container `{}` cannot be started in state {status}", env.id),
                    0,
                ));
            }
        }

        let config = dir.path.join(CONFIG_FILE);
        let spec = Spec::load(&config)
            .map_err(|e| RuntimeError::new(format!("cannot parse `{}`: {e}", config.display()), 0))?;
        let child = self.spawn(&dir, &spec, Stdio::null(), true)?;
        env.log
            .debug(format!("started container `{}` as pid {}", env.id, child.id()));
        reap(child);
        Ok(())
    }

    fn run(&self, env: RuntimeEnv, spec: &Spec, opts: RunOptions) -> Result<i32, RuntimeError> {
        self.create(env, spec, CreateOptions {
            preserve_fds: opts.preserve_fds,
        })?;
        let dir = StateDir::new(env)?;
        let new_group = !opts.share_process_group;
        let mut child = match self.spawn(&dir, spec, Stdio::inherit(), new_group) {
            Ok(child) => child,
            Err(e) => {
                let _ = dir.remove();
                return Err(e);
            }
        };

        if env.config.detach {
            reap(child);
            return Ok(0);
        }

        let status = child
            .wait()
            .map_err(|e| io_error(format_args!("wait for container `{}`", env.id), e))?;
        let code = exit_code(status);
        env.log
            .debug(format!("container `{}` exited with status {code}", env.id));

        if opts.keep {
            dir.update(|state| state.status = ContainerStatus::Stopped)?;
        } else {
            dir.remove()?;
        }
        Ok(code)
    }

    fn delete(&self, env: RuntimeEnv, force: bool) -> Result<(), RuntimeError> {
        let dir = StateDir::new(env)?;
        let state = dir.load()?;
        if matches!(
            state.status,
            ContainerStatus::Running | ContainerStatus::Paused
        ) {
            if !force {
                return Err(RuntimeError::from_errno(
                    format!("container `{}` is running", env.id),
                    Errno::EBUSY,
                ));
            }
            let _ = signal_group(Pid::from_raw(state.pid), Signal::SIGKILL);
        }
        dir.remove()?;
        env.log.debug(format!("deleted container `{}`", env.id));
        Ok(())
    }

    fn kill(&self, env: RuntimeEnv, signal: Signal, all: bool) -> Result<(), RuntimeError> {
        let dir = StateDir::new(env)?;
        let (_, pid) = dir.live_pid()?;
        let res = if all {
            signal_group(pid, signal)
        } else {
            kill(pid, signal)
        };
        res.map_err(|e| RuntimeError::from_errno(format!("kill container `{}`", env.id), e))
    }

    fn pause(&self, env: RuntimeEnv) -> Result<(), RuntimeError> {
        let dir = StateDir::new(env)?;
        let (state, pid) = dir.live_pid()?;
        if state.status == ContainerStatus::Paused {
            return Err(RuntimeError::new(
                format!("container `{}` is already paused", env.id),
                0,
            ));
        }
        signal_group(pid, Signal::SIGSTOP)
            .map_err(|e| RuntimeError::from_errno(format!("pause container `{}`", env.id), e))?;
        dir.update(|state| state.status = ContainerStatus::Paused)
    }

    fn resume(&self, env: RuntimeEnv) -> Result<(), RuntimeError> {
        let dir = StateDir::new(env)?;
        let (state, pid) = dir.live_pid()?;
        if state.status != ContainerStatus::Paused {
            return Err(RuntimeError::new(
                format!("container `{}` is not paused", env.id),
                0,
            ));
        }
        signal_group(pid, Signal::SIGCONT)
            .map_err(|e| RuntimeError::from_errno(format!("resume container `{}`", env.id), e))?;
        dir.update(|state| state.status = ContainerStatus::Running)
    }

    fn update(&self, _env: RuntimeEnv, _resources: &LinuxResources) -> Result<(), RuntimeError> {
        Err(RuntimeError::from_errno(
            "updating resources is not supported by the host runtime",
            Errno::ENOTSUP,
        ))
    }

    fn exec(&self, env: RuntimeEnv, process: &Process, detach: bool) -> Result<(), RuntimeError> {
        let dir = StateDir::new(env)?;
        let state = dir.load()?;
        if state.status != ContainerStatus::Running {
            return Err(dir.not_running());
        }

        let mut cmd = command(process, true)?;
        let mut child = cmd
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| io_error(format_args!("exec `{:?}`", cmd.get_program()), e))?;
        if detach {
            reap(child);
            return Ok(());
        }

        let status = child
            .wait()
            .map_err(|e| io_error("wait for exec'd process", e))?;
        match exit_code(status) {
            0 => Ok(()),
            code => Err(RuntimeError::new(
                format!("exec'd process exited with status {code}"),
                0,
            )),
        }
    }

    fn state_json(&self, env: RuntimeEnv) -> Result<String, RuntimeError> {
        let state = StateDir::new(env)?.load()?;
        Ok(serde_json::to_string(&state)?)
    }

    fn pids(&self, env: RuntimeEnv, recurse: bool) -> Result<Vec<i32>, RuntimeError> {
        let (_, pid) = StateDir::new(env)?.live_pid()?;
        Ok(procfs::process_tree(pid.as_raw(), recurse))
    }

    fn is_running(&self, env: RuntimeEnv) -> Result<bool, RuntimeError> {
        let state = StateDir::new(env)?.load()?;
        Ok(state.status == ContainerStatus::Running)
    }

    fn list(&self, env: RuntimeEnv) -> Result<Vec<String>, RuntimeError> {
        let root = &env.config.state_root;
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_error(format_args!("read `{}`", root.display()), e)),
        };

        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().join(STATE_FILE).is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tempfile::tempdir;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::{Error, ErrorKind};
    use crate::logging::{LogOutput, Severity};
    use crate::testutil::sh_spec;

    fn kind(err: RuntimeError) -> ErrorKind {
        Error::from(err).kind()
    }

    fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_run_reports_exit_code() -> anyhow::Result<()> {
        let root = tempdir()?;
        let config = RuntimeConfig::new(root.path());
        let log = LogOutput::stderr(Severity::Error);
        let env = RuntimeEnv {
            config: &config,
            id: "exit3",
            log: &log,
        };

        let code = HostRuntime.run(env, &sh_spec("exit 3"), RunOptions::default())?;
        assert_eq!(code, 3);
        assert!(HostRuntime.list(env)?.is_empty());

        let code = HostRuntime.run(env, &sh_spec("kill -TERM $$"), RunOptions {
            keep: true,
            ..Default::default()
        })?;
        assert_eq!(code, 128 + libc::SIGTERM);
        assert_eq!(HostRuntime.list(env)?, vec!["exit3"]);

        let state: ContainerState = serde_json::from_str(&HostRuntime.state_json(env)?)?;
        assert_eq!(state.status, ContainerStatus::Stopped);
        Ok(())
    }

    #[test]
    fn test_lifecycle() -> anyhow::Result<()> {
        let root = tempdir()?;
        let config = RuntimeConfig::new(root.path());
        let log = LogOutput::stderr(Severity::Error);
        let env = RuntimeEnv {
            config: &config,
            id: "life",
            log: &log,
        };

        HostRuntime.create(env, &sh_spec("exec sleep 30"), CreateOptions::default())?;
        let err = HostRuntime
            .create(env, &sh_spec("true"), CreateOptions::default())
            .unwrap_err();
        assert_eq!(kind(err), ErrorKind::AlreadyExists);
        assert!(!HostRuntime.is_running(env)?);
        assert_eq!(
            kind(HostRuntime.kill(env, Signal::SIGTERM, false).unwrap_err()),
            ErrorKind::ContainerNotRunning
        );

        HostRuntime.start(env)?;
        assert!(HostRuntime.is_running(env)?);
        assert_eq!(
            kind(HostRuntime.start(env).unwrap_err()),
            ErrorKind::ContainerRunning
        );
        assert_eq!(
            kind(HostRuntime.delete(env, false).unwrap_err()),
            ErrorKind::ContainerRunning
        );

        HostRuntime.pause(env)?;
        assert!(!HostRuntime.is_running(env)?);
        HostRuntime.resume(env)?;
        assert!(HostRuntime.is_running(env)?);

        let pids = HostRuntime.pids(env, true)?;
        assert_eq!(pids.len(), 1);

        HostRuntime.kill(env, Signal::SIGKILL, true)?;
        wait_until(|| !HostRuntime.is_running(env).unwrap());

        HostRuntime.delete(env, false)?;
        assert_eq!(
            kind(HostRuntime.state_json(env).unwrap_err()),
            ErrorKind::NotFound
        );
        Ok(())
    }

    #[test]
    fn test_update_not_supported() {
        let config = RuntimeConfig::default();
        let log = LogOutput::stderr(Severity::Error);
        let env = RuntimeEnv {
            config: &config,
            id: "any",
            log: &log,
        };
        let err = HostRuntime
            .update(env, &LinuxResources::default())
            .unwrap_err();
        assert_eq!(err.status, libc::ENOTSUP);
    }

    #[test]
    fn test_invalid_id() {
        let config = RuntimeConfig::default();
        let log = LogOutput::stderr(Severity::Error);
        let env = RuntimeEnv {
            config: &config,
            id: "../escape",
            log: &log,
        };
        let err = HostRuntime.state_json(env).unwrap_err();
        assert_eq!(kind(err), ErrorKind::InvalidSpec);
    }
}
