#![doc = include_str!("../README.md")]
#![cfg(unix)]

pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod spec;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::RuntimeConfig;
pub use container::{Container, ContainerState, ContainerStatus, ExecOptions};
pub use context::{Launched, RuntimeContext};
pub use error::{ContainerError, Error, ErrorKind, Result, RuntimeError, classify};
pub use logging::{LogEntry, LogHandler, LogRegistry, Severity};
pub use nix::sys::signal::Signal;
pub use runtime::{ContainerRuntime, CreateOptions, HostRuntime, RunOptions, RuntimeEnv};
#[cfg(feature = "libcontainer")]
pub use runtime::LibcontainerRuntime;
pub use spec::ContainerSpec;
pub use supervisor::{ChildHandle, Input, IoConfig, Output, launch_isolated};
