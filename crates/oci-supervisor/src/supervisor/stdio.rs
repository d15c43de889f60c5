use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl, open};
use nix::sys::stat::Mode;
use nix::unistd::{dup2, pipe2};

use crate::error::{Error, Result};
use crate::logging::LogHandler;

/// Source of the child's standard input.
#[derive(Default)]
pub enum Input {
    /// Read from `/dev/null`
    #[default]
    Null,
    /// Pumped into the child through a pipe
    Reader(Box<dyn Read + Send>),
    /// Opened read-only by the child
    File(PathBuf),
}

/// Destination of the child's standard output or error.
#[derive(Default)]
pub enum Output {
    /// Keep the descriptor inherited from the calling process
    #[default]
    Inherit,
    /// Pumped out of the child through a pipe
    Writer(Box<dyn Write + Send>),
    /// Opened by the child for appending, created if missing
    File(PathBuf),
}

impl Input {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        Input::Reader(Box::new(reader))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Input::File(path.into())
    }
}

impl Output {
    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Output::Writer(Box::new(writer))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Output::File(path.into())
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Null => f.write_str("Null"),
            Input::Reader(_) => f.write_str("Reader"),
            Input::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Inherit => f.write_str("Inherit"),
            Output::Writer(_) => f.write_str("Writer"),
            Output::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// I/O wiring of a supervised launch.
#[derive(Debug, Default)]
pub struct IoConfig {
    pub stdin: Input,
    pub stdout: Output,
    pub stderr: Output,
    /// Receives the runtime's diagnostics. Overrides the context's handler.
    pub log: Option<LogHandler>,
}

impl IoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdin(mut self, stdin: Input) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_stdout(mut self, stdout: Output) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn with_stderr(mut self, stderr: Output) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_log_handler(mut self, handler: LogHandler) -> Self {
        self.log = Some(handler);
        self
    }

    /// Creates the pipes and splits the configuration into what the child
    /// installs and what the parent pumps.
    pub(super) fn split(self) -> Result<(ChildStdio, ParentStdio)> {
        let (stdin, stdin_pump) = match self.stdin {
            Input::Null => (Redirect::open("/dev/null", OFlag::O_RDONLY)?, None),
            Input::File(path) => (Redirect::open(&path, OFlag::O_RDONLY)?, None),
            Input::Reader(source) => {
                let (r, w) = cloexec_pipe()?;
                (Redirect::Fd(r), Some((source, File::from(w))))
            }
        };
        let (stdout, stdout_pump) = split_output(self.stdout)?;
        let (stderr, stderr_pump) = split_output(self.stderr)?;

        let child = ChildStdio {
            stdin,
            stdout,
            stderr,
        };
        let parent = ParentStdio {
            stdin: stdin_pump,
            stdout: stdout_pump,
            stderr: stderr_pump,
        };
        Ok((child, parent))
    }
}

type OutputPump = Option<(File, Box<dyn Write + Send>)>;

fn split_output(output: Output) -> Result<(Redirect, OutputPump)> {
    match output {
        Output::Inherit => Ok((Redirect::Keep, None)),
        Output::File(path) => {
            let flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND;
            Ok((Redirect::open(&path, flags)?, None))
        }
        Output::Writer(sink) => {
            let (r, w) = cloexec_pipe()?;
            Ok((Redirect::Fd(w), Some((File::from(r), sink))))
        }
    }
}

pub(super) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Io(e.into()))
}

/// What the child does with one of its standard descriptors.
pub(super) enum Redirect {
    Keep,
    Fd(OwnedFd),
    /// Path prepared before forking, opened in the child
    Open(CString, OFlag),
}

impl Redirect {
    fn open(path: impl AsRef<Path>, flags: OFlag) -> Result<Self> {
        let path = path.as_ref();
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidArgument(format!("path {path:?} contains a nul byte")))?;
        Ok(Redirect::Open(c_path, flags))
    }

    /// Makes `target` refer to this redirection. Runs in the forked child.
    fn apply(self, target: RawFd) -> Result<(), Errno> {
        match self {
            Redirect::Keep => Ok(()),
            Redirect::Fd(fd) => install(fd, target),
            Redirect::Open(path, flags) => {
                let mode = Mode::from_bits_truncate(0o644);
                let fd = open(path.as_c_str(), flags | OFlag::O_CLOEXEC, mode)?;
                // SAFETY: `open` just returned this descriptor and nothing else owns it
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                install(fd, target)
            }
        }
    }
}

fn install(fd: OwnedFd, target: RawFd) -> Result<(), Errno> {
    if fd.as_raw_fd() == target {
        // already in place, only the close-on-exec flag has to go
        fcntl(target, FcntlArg::F_SETFD(FdFlag::empty()))?;
        let _ = fd.into_raw_fd();
        return Ok(());
    }
    dup2(fd.as_raw_fd(), target)?;
    Ok(())
}

/// Child side of the standard streams.
pub(super) struct ChildStdio {
    stdin: Redirect,
    stdout: Redirect,
    stderr: Redirect,
}

impl ChildStdio {
    pub(super) fn redirect(self) -> Result<(), Errno> {
        self.stdin.apply(STDIN_FILENO)?;
        self.stdout.apply(STDOUT_FILENO)?;
        self.stderr.apply(STDERR_FILENO)?;
        Ok(())
    }
}

/// Parent side of the pumped streams.
pub(super) struct ParentStdio {
    pub stdin: Option<(Box<dyn Read + Send>, File)>,
    pub stdout: OutputPump,
    pub stderr: OutputPump,
}
