//! A runtime backed by youki's `libcontainer`.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, bail};
use libcontainer::container::builder::ContainerBuilder;
use libcontainer::container::{Container, ContainerStatus as YoukiStatus};
use libcontainer::syscall::syscall::SyscallType;
use libcontainer::workload::default::DefaultExecutor;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use oci_spec::runtime::{LinuxResources, Process, Spec};

use super::{ContainerRuntime, CreateOptions, RunOptions, RuntimeEnv, procfs};
use crate::container::{ContainerState, ContainerStatus};
use crate::error::RuntimeError;

/// A [`ContainerRuntime`] that isolates containers with namespaces and cgroups.
///
/// The OCI spec is written to `<bundle>/config.json` before the container is built;
/// per-container state lives in `<state_root>/<id>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibcontainerRuntime;

/// Keeps the first errno found in the error chain so the failure can be classified.
fn runtime_error(err: anyhow::Error) -> RuntimeError {
    let status = err
        .chain()
        .find_map(|e| {
            e.downcast_ref::<Errno>()
                .map(|errno| *errno as i32)
                .or_else(|| e.downcast_ref::<io::Error>().and_then(|e| e.raw_os_error()))
        })
        .unwrap_or_default();
    RuntimeError::new(format!("{err:#}"), status)
}

fn status(status: YoukiStatus) -> ContainerStatus {
    match status {
        YoukiStatus::Creating => ContainerStatus::Creating,
        YoukiStatus::Created => ContainerStatus::Created,
        YoukiStatus::Running => ContainerStatus::Running,
        YoukiStatus::Stopped => ContainerStatus::Stopped,
        YoukiStatus::Paused => ContainerStatus::Paused,
    }
}

fn wait_for(pid: Pid) -> anyhow::Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context(format!("waitpid {pid}")),
        }
    }
}

impl LibcontainerRuntime {
    pub fn new() -> Self {
        Self
    }

    fn container_root(env: RuntimeEnv) -> PathBuf {
        env.config.state_root.join(env.id)
    }

    fn load(env: RuntimeEnv) -> anyhow::Result<Container> {
        let root = Self::container_root(env);
        if !root.exists() {
            return Err(io::Error::from(io::ErrorKind::NotFound))
                .context(format!("container `{}` does not exist", env.id));
        }
        Container::load(root).with_context(|| format!("load container `{}`", env.id))
    }

    fn build(env: RuntimeEnv, spec: &Spec, preserve_fds: i32, detach: bool) -> anyhow::Result<Container> {
        let config = env.config;
        if Self::container_root(env).exists() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists))
                .context(format!("container `{}` already exists", env.id));
        }

        fs::create_dir_all(&config.state_root)
            .with_context(|| format!("create `{}`", config.state_root.display()))?;
        spec.save(config.bundle.join("config.json"))
            .context("cannot save config.json to bundle")?;

        let container = ContainerBuilder::new(env.id.to_string(), SyscallType::default())
            .with_executor(DefaultExecutor {})
            .with_pid_file(config.pid_file.as_ref())?
            .with_console_socket(config.console_socket.as_ref())
            .with_root_path(config.state_root.clone())?
            .with_preserved_fds(preserve_fds)
            .validate_id()?
            .as_init(&config.bundle)
            .with_systemd(config.systemd_cgroup)
            .with_detach(detach)
            .build()?;
        env.log.debug(format!("created container `{}`", env.id));
        Ok(container)
    }

    fn run_impl(env: RuntimeEnv, spec: &Spec, opts: RunOptions) -> anyhow::Result<i32> {
        let detach = env.config.detach;
        let mut container = Self::build(env, spec, opts.preserve_fds, detach)?;
        container.start()?;
        if detach {
            return Ok(0);
        }

        let pid = container.pid().context("container has no init process")?;
        let code = wait_for(pid)?;
        env.log
            .debug(format!("container `{}` exited with status {code}", env.id));

        if !opts.keep {
            container.refresh_status()?;
            container.delete(true)?;
        }
        Ok(code)
    }

    fn exec_impl(env: RuntimeEnv, process: &Process, detach: bool) -> anyhow::Result<()> {
        let container = Self::load(env)?;
        if container.status() != YoukiStatus::Running {
            bail!("container `{}` is not running", env.id);
        }

        let args = process.args().clone().unwrap_or_default();
        if args.is_empty() {
            bail!("invalid process: args must not be empty");
        }
        let vars: HashMap<String, String> = process
            .env()
            .iter()
            .flatten()
            .filter_map(|var| var.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let pid = ContainerBuilder::new(env.id.to_string(), SyscallType::default())
            .with_executor(DefaultExecutor {})
            .with_root_path(env.config.state_root.clone())?
            .with_console_socket(env.config.console_socket.as_ref())
            .validate_id()?
            .as_tenant()
            .with_detach(detach)
            .with_cwd(Some(process.cwd().clone()))
            .with_env(vars)
            .with_container_args(args)
            .build()?;

        if detach {
            return Ok(());
        }
        match wait_for(pid)? {
            0 => Ok(()),
            code => bail!("exec'd process exited with status {code}"),
        }
    }

    fn state_impl(env: RuntimeEnv) -> anyhow::Result<ContainerState> {
        let container = Self::load(env)?;
        let state = &container.state;
        Ok(ContainerState {
            oci_version: state.oci_version.clone(),
            id: state.id.clone(),
            status: status(container.status()),
            pid: state.pid.unwrap_or_default(),
            bundle: state.bundle.clone(),
            annotations: state.annotations.clone(),
            created: state.created,
        })
    }
}

impl ContainerRuntime for LibcontainerRuntime {
    fn name(&self) -> &'static str {
        "libcontainer"
    }

    fn create(&self, env: RuntimeEnv, spec: &Spec, opts: CreateOptions) -> Result<(), RuntimeError> {
        Self::build(env, spec, opts.preserve_fds, true)
            .map(drop)
            .map_err(runtime_error)
    }

    fn start(&self, env: RuntimeEnv) -> Result<(), RuntimeError> {
        (|| {
            let mut container = Self::load(env)?;
            container.start()?;
            anyhow::Ok(())
        })()
        .map_err(runtime_error)
    }

    fn run(&self, env: RuntimeEnv, spec: &Spec, opts: RunOptions) -> Result<i32, RuntimeError> {
        Self::run_impl(env, spec, opts).map_err(runtime_error)
    }

    fn delete(&self, env: RuntimeEnv, force: bool) -> Result<(), RuntimeError> {
        (|| {
            let mut container = Self::load(env)?;
            if container.status() == YoukiStatus::Running && !force {
                bail!("container `{}` is running", env.id);
            }
            container.delete(force)?;
            anyhow::Ok(())
        })()
        .map_err(runtime_error)
    }

    fn kill(&self, env: RuntimeEnv, signal: Signal, all: bool) -> Result<(), RuntimeError> {
        (|| {
            let mut container = Self::load(env)?;
            if !container.can_kill() {
                bail!("container `{}` is not running", env.id);
            }
            let signal = libcontainer::signal::Signal::try_from(signal as i32)
                .context("invalid signal number")?;
            container.kill(signal, all)?;
            anyhow::Ok(())
        })()
        .map_err(runtime_error)
    }

    fn pause(&self, env: RuntimeEnv) -> Result<(), RuntimeError> {
        (|| {
            Self::load(env)?.pause()?;
            anyhow::Ok(())
        })()
        .map_err(runtime_error)
    }

    fn resume(&self, env: RuntimeEnv) -> Result<(), RuntimeError> {
        (|| {
            Self::load(env)?.resume()?;
            anyhow::Ok(())
        })()
        .map_err(runtime_error)
    }

    fn update(&self, _env: RuntimeEnv, _resources: &LinuxResources) -> Result<(), RuntimeError> {
        Err(RuntimeError::from_errno(
            "updating resources is not supported by libcontainer",
            Errno::ENOTSUP,
        ))
    }

    fn exec(&self, env: RuntimeEnv, process: &Process, detach: bool) -> Result<(), RuntimeError> {
        Self::exec_impl(env, process, detach).map_err(runtime_error)
    }

    fn state_json(&self, env: RuntimeEnv) -> Result<String, RuntimeError> {
        let state = Self::state_impl(env).map_err(runtime_error)?;
        Ok(serde_json::to_string(&state)?)
    }

    fn pids(&self, env: RuntimeEnv, recurse: bool) -> Result<Vec<i32>, RuntimeError> {
        let state = Self::state_impl(env).map_err(runtime_error)?;
        if !matches!(
            state.status,
            ContainerStatus::Running | ContainerStatus::Paused
        ) {
            return Err(RuntimeError::from_errno(
                format!("container `{}` is not running", env.id),
                Errno::ESRCH,
            ));
        }
        Ok(procfs::process_tree(state.pid, recurse))
    }

    fn is_running(&self, env: RuntimeEnv) -> Result<bool, RuntimeError> {
        let container = Self::load(env).map_err(runtime_error)?;
        Ok(container.status() == YoukiStatus::Running)
    }

    fn list(&self, env: RuntimeEnv) -> Result<Vec<String>, RuntimeError> {
        let root = &env.config.state_root;
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().join("state.json").is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
