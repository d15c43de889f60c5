//! Helpers shared by the unit tests.

use std::io::{self, Write};
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use oci_spec::runtime::{LinuxResources, Process, ProcessBuilder, Spec};

use crate::error::RuntimeError;
use crate::logging::Severity;
use crate::runtime::{ContainerRuntime, CreateOptions, RunOptions, RuntimeEnv};

/// A spec whose process runs `script` with `/bin/sh`.
pub(crate) fn sh_spec(script: &str) -> Spec {
    let mut spec = Spec::default();
    spec.set_process(Some(sh_process(script)));
    spec
}

pub(crate) fn sh_process(script: &str) -> Process {
    ProcessBuilder::default()
        .args(vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()])
        .env(vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()])
        .cwd("/")
        .build()
        .unwrap()
}

/// A [`Write`] sink whose contents can be inspected after it was handed away.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub(crate) fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn text(&self) -> String {
        String::from_utf8(self.contents()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One step of [`TestRuntime::run`].
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Log(Severity, i32, &'static str),
    /// Log the target container id as an error record
    LogId,
    Stdout(&'static str),
    Stderr(&'static str),
    /// Copy stdin to stdout until end-of-file
    Echo,
    Sleep(Duration),
    Exit(i32),
    Fail(&'static str, i32),
}

/// A runtime whose `run` replays scripted steps instead of starting a container.
/// Writes bypass the std stream locks since `run` executes in a forked child.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestRuntime {
    pub steps: Vec<Step>,
}

impl TestRuntime {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }
}

fn write_fd(fd: impl AsFd, mut data: &[u8]) {
    while !data.is_empty() {
        match nix::unistd::write(&fd, data) {
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}

fn unsupported() -> RuntimeError {
    RuntimeError::from_errno("not supported by the test runtime", Errno::ENOTSUP)
}

impl ContainerRuntime for TestRuntime {
    fn name(&self) -> &'static str {
        "test"
    }

    fn create(&self, _: RuntimeEnv, _: &Spec, _: CreateOptions) -> Result<(), RuntimeError> {
        Err(unsupported())
    }

    fn start(&self, _: RuntimeEnv) -> Result<(), RuntimeError> {
        Err(unsupported())
    }

    fn run(&self, env: RuntimeEnv, _: &Spec, _: RunOptions) -> Result<i32, RuntimeError> {
        for step in &self.steps {
            match step {
                Step::Log(severity, errno, msg) => {
                    env.log.emit(crate::logging::LogEntry::new(*severity, *errno, *msg))
                }
                Step::LogId => env.log.error(0, env.id),
                Step::Stdout(s) => write_fd(io::stdout().as_fd(), s.as_bytes()),
                Step::Stderr(s) => write_fd(io::stderr().as_fd(), s.as_bytes()),
                Step::Echo => {
                    let mut buf = [0u8; 4096];
                    loop {
                        match nix::unistd::read(libc::STDIN_FILENO, &mut buf) {
                            Ok(0) => break,
                            Ok(n) => write_fd(io::stdout().as_fd(), &buf[..n]),
                            Err(Errno::EINTR) => continue,
                            Err(_) => break,
                        }
                    }
                }
                Step::Sleep(d) => thread::sleep(*d),
                Step::Exit(code) => return Ok(*code),
                Step::Fail(msg, status) => return Err(RuntimeError::new(*msg, *status)),
            }
        }
        Ok(0)
    }

    fn delete(&self, _: RuntimeEnv, _: bool) -> Result<(), RuntimeError> {
        Err(unsupported())
    }

    fn kill(&self, _: RuntimeEnv, _: Signal, _: bool) -> Result<(), RuntimeError> {
        Err(unsupported())
    }

    fn pause(&self, env: RuntimeEnv) -> Result<(), RuntimeError> {
        env.log.debug(format!("pausing {}", env.id));
        Ok(())
    }

    fn resume(&self, _: RuntimeEnv) -> Result<(), RuntimeError> {
        Err(unsupported())
    }

    fn update(&self, _: RuntimeEnv, _: &LinuxResources) -> Result<(), RuntimeError> {
        Err(unsupported())
    }

    fn exec(&self, _: RuntimeEnv, _: &Process, _: bool) -> Result<(), RuntimeError> {
        Err(unsupported())
    }

    fn state_json(&self, _: RuntimeEnv) -> Result<String, RuntimeError> {
        Err(unsupported())
    }

    fn pids(&self, _: RuntimeEnv, _: bool) -> Result<Vec<i32>, RuntimeError> {
        Err(unsupported())
    }

    fn is_running(&self, _: RuntimeEnv) -> Result<bool, RuntimeError> {
        Err(unsupported())
    }

    fn list(&self, _: RuntimeEnv) -> Result<Vec<String>, RuntimeError> {
        Ok(vec![])
    }
}
