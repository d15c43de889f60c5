//! Configuration of a [`RuntimeContext`](crate::RuntimeContext).

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_STATE_ROOT: &str = "/run/oci-supervisor";

/// Execution environment shared by all calls made through one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Directory holding the runtime's per-container state
    pub state_root: PathBuf,
    /// Path to the OCI bundle directory
    pub bundle: PathBuf,
    /// Unix socket that receives the pseudo-terminal master of a container
    pub console_socket: Option<PathBuf>,
    /// File the runtime writes the container pid to
    pub pid_file: Option<PathBuf>,
    pub systemd_cgroup: bool,
    /// Return from `run` as soon as the container has started
    pub detach: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(DEFAULT_STATE_ROOT),
            bundle: PathBuf::from("."),
            console_socket: None,
            pid_file: None,
            systemd_cgroup: false,
            detach: false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Options {
    root: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            ..Default::default()
        }
    }

    /// Reads a configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn with_bundle(mut self, bundle: impl Into<PathBuf>) -> Self {
        self.bundle = bundle.into();
        self
    }

    /// Uses `bundle`, honouring the `root` field of its `options.json` if it has one.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "Info"))]
    pub fn with_bundle_options(mut self, bundle: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let bundle = bundle.as_ref();
        self.bundle = bundle.to_owned();

        let file = match File::open(bundle.join("options.json")) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(self),
            Err(e) => return Err(e.into()),
        };
        if let Some(root) = serde_json::from_reader::<_, Options>(file)?.root {
            log::info!("container runtime root path is {root:?}");
            self.state_root = root;
        }
        Ok(self)
    }
}
