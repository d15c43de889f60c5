//! The container runtime the supervisor drives.
//!
//! Isolation itself (namespaces, cgroups, mounts) is entirely the runtime's business.
//! The supervisor only needs the primitives of [`ContainerRuntime`].

mod host;
#[cfg(feature = "libcontainer")]
mod libcontainer;
pub(crate) mod procfs;

use nix::sys::signal::Signal;
use oci_spec::runtime::{LinuxResources, Process, Spec};

pub use self::host::HostRuntime;
#[cfg(feature = "libcontainer")]
pub use self::libcontainer::LibcontainerRuntime;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::logging::LogOutput;

/// Everything a runtime call sees of the context that issued it.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeEnv<'a> {
    pub config: &'a RuntimeConfig,
    /// Target container id. Empty for calls that are not about one container.
    pub id: &'a str,
    pub log: &'a LogOutput,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Keep the container's state after it exits instead of deleting it
    pub keep: bool,
    /// Number of descriptors after stdio passed on to the container process
    pub preserve_fds: i32,
    /// Start the container process in the caller's process group instead of a
    /// new one. Supervised launches always set it, so that signalling the
    /// supervised child's group reaches the container as well.
    pub share_process_group: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub preserve_fds: i32,
}

pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Creates the container without starting its process.
    fn create(&self, env: RuntimeEnv, spec: &Spec, opts: CreateOptions) -> Result<(), RuntimeError>;

    fn start(&self, env: RuntimeEnv) -> Result<(), RuntimeError>;

    /// Creates and starts the container, then blocks until its process exits.
    /// Returns the container's exit status (`128 + signal` for signal deaths).
    ///
    /// Inside a supervised child this is the last thing that runs before the
    /// child exits with the returned status.
    fn run(&self, env: RuntimeEnv, spec: &Spec, opts: RunOptions) -> Result<i32, RuntimeError>;

    fn delete(&self, env: RuntimeEnv, force: bool) -> Result<(), RuntimeError>;

    /// Signals the init process, or every process of the container when `all` is set.
    fn kill(&self, env: RuntimeEnv, signal: Signal, all: bool) -> Result<(), RuntimeError>;

    fn pause(&self, env: RuntimeEnv) -> Result<(), RuntimeError>;

    fn resume(&self, env: RuntimeEnv) -> Result<(), RuntimeError>;

    fn update(&self, env: RuntimeEnv, resources: &LinuxResources) -> Result<(), RuntimeError>;

    /// Starts an additional process inside a running container.
    fn exec(&self, env: RuntimeEnv, process: &Process, detach: bool) -> Result<(), RuntimeError>;

    /// The container state as OCI state JSON.
    fn state_json(&self, env: RuntimeEnv) -> Result<String, RuntimeError>;

    fn pids(&self, env: RuntimeEnv, recurse: bool) -> Result<Vec<i32>, RuntimeError>;

    fn is_running(&self, env: RuntimeEnv) -> Result<bool, RuntimeError>;

    /// Ids of all containers under the configured state root.
    fn list(&self, env: RuntimeEnv) -> Result<Vec<String>, RuntimeError>;
}
