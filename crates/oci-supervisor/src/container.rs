//! Handle to a single container managed through a [`RuntimeContext`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use oci_spec::runtime::{LinuxResources, Process};
use serde::{Deserialize, Serialize};

use crate::context::RuntimeContext;
use crate::error::Result;

/// Container status values as defined by the OCI runtime spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Created,
    Running,
    Stopped,
    Paused,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Creating => "creating",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// The state of a container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    #[serde(default)]
    pub pid: i32,
    pub bundle: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Overrides applied to the process passed to [`Container::exec`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Return as soon as the process has started
    pub detach: bool,
    /// Allocate a pseudo-terminal for the process
    pub terminal: bool,
    pub cwd: Option<PathBuf>,
}

/// A container known to a [`RuntimeContext`].
///
/// Creating a handle does not check that the container exists; the first
/// operation fails with [`ErrorKind::NotFound`](crate::ErrorKind::NotFound) if it does not.
#[derive(Clone)]
pub struct Container<'a> {
    id: String,
    runtime: &'a RuntimeContext,
}

impl fmt::Debug for Container<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container").field("id", &self.id).finish()
    }
}

impl<'a> Container<'a> {
    pub(crate) fn new(id: impl Into<String>, runtime: &'a RuntimeContext) -> Self {
        Self {
            id: id.into(),
            runtime,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts a previously created container.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "Info"))]
    pub fn start(&self) -> Result<()> {
        log::info!("starting container {}", self.id);
        self.runtime.call(&self.id, |rt, env| rt.start(env))
    }

    /// Sends a signal to the container's init process.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "Info"))]
    pub fn kill(&self, signal: Signal) -> Result<()> {
        log::info!("sending {signal} to container {}", self.id);
        self.runtime.call(&self.id, |rt, env| rt.kill(env, signal, false))
    }

    /// Sends a signal to every process in the container.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "Info"))]
    pub fn kill_all(&self, signal: Signal) -> Result<()> {
        log::info!("sending {signal} to all processes of container {}", self.id);
        self.runtime.call(&self.id, |rt, env| rt.kill(env, signal, true))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "Info"))]
    pub fn delete(&self, force: bool) -> Result<()> {
        log::info!("deleting container {}", self.id);
        self.runtime.call(&self.id, |rt, env| rt.delete(env, force))
    }

    pub fn state(&self) -> Result<ContainerState> {
        let json = self.state_json()?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn state_json(&self) -> Result<String> {
        self.runtime.call(&self.id, |rt, env| rt.state_json(env))
    }

    /// Executes an additional process in the container.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(process), level = "Info"))]
    pub fn exec(&self, process: &Process, opts: ExecOptions) -> Result<()> {
        let mut process = process.clone();
        if opts.terminal {
            process.set_terminal(Some(true));
        }
        if let Some(cwd) = opts.cwd {
            process.set_cwd(cwd);
        }
        self.runtime
            .call(&self.id, |rt, env| rt.exec(env, &process, opts.detach))
    }

    pub fn update_resources(&self, resources: &LinuxResources) -> Result<()> {
        self.runtime.call(&self.id, |rt, env| rt.update(env, resources))
    }

    /// Freezes every process of the container.
    pub fn pause(&self) -> Result<()> {
        self.runtime.call(&self.id, |rt, env| rt.pause(env))
    }

    pub fn unpause(&self) -> Result<()> {
        self.runtime.call(&self.id, |rt, env| rt.resume(env))
    }

    pub fn is_running(&self) -> Result<bool> {
        self.runtime.call(&self.id, |rt, env| rt.is_running(env))
    }

    /// Pids of the container's processes. With `recurse`, descendants of the
    /// init process are included.
    pub fn pids(&self, recurse: bool) -> Result<Vec<i32>> {
        self.runtime.call(&self.id, |rt, env| rt.pids(env, recurse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_json_shape() {
        let json = r#"{
            "ociVersion": "1.0.2",
            "id": "abc",
            "status": "running",
            "pid": 4242,
            "bundle": "/bundles/abc",
            "annotations": {"a": "b"}
        }"#;
        let state: ContainerState = serde_json::from_str(json).unwrap();
        assert_eq!(state.id, "abc");
        assert_eq!(state.status, ContainerStatus::Running);
        assert_eq!(state.pid, 4242);
        assert_eq!(state.annotations.unwrap()["a"], "b");
        assert!(state.created.is_none());
    }

    #[test]
    fn test_stopped_without_pid() {
        let json = r#"{"ociVersion": "1.0.2", "id": "x", "status": "stopped", "bundle": "."}"#;
        let state: ContainerState = serde_json::from_str(json).unwrap();
        assert_eq!(state.status, ContainerStatus::Stopped);
        assert_eq!(state.pid, 0);
    }

    #[test]
    fn test_status_display_matches_serde() {
        for status in [
            ContainerStatus::Creating,
            ContainerStatus::Created,
            ContainerStatus::Running,
            ContainerStatus::Stopped,
            ContainerStatus::Paused,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }
}
