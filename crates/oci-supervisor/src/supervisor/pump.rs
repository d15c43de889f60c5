//! Threads moving data between the caller's streams and the child's pipes.

use std::fs::File;
use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

use crate::logging::LogHandler;
use crate::logging::channel::LogReader;

/// The pump threads of one launch. Each pump ends on its own when the child
/// closes its end of the pipe, so joining them after the child has been
/// reaped does not block indefinitely.
#[derive(Debug, Default)]
pub(crate) struct PumpSet {
    threads: Vec<JoinHandle<()>>,
}

impl PumpSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn spawn(&mut self, name: &str, f: impl FnOnce() + Send + 'static) -> io::Result<()> {
        let handle = thread::Builder::new()
            .name(format!("pump-{name}"))
            .spawn(f)?;
        self.threads.push(handle);
        Ok(())
    }

    /// Copies `source` into the child's stdin. The pipe is closed once
    /// `source` is exhausted so the child sees end-of-file.
    pub(crate) fn input(&mut self, mut source: Box<dyn Read + Send>, pipe: File) -> io::Result<()> {
        self.spawn("stdin", move || {
            let mut pipe = pipe;
            if let Err(e) = io::copy(&mut source, &mut pipe) {
                log::debug!("stdin pump stopped: {e}");
            }
        })
    }

    /// Copies one of the child's output streams into `sink` until end-of-file.
    pub(crate) fn output(
        &mut self,
        name: &str,
        pipe: File,
        mut sink: Box<dyn Write + Send>,
    ) -> io::Result<()> {
        self.spawn(name, move || {
            let mut pipe = pipe;
            let res = io::copy(&mut pipe, &mut sink).and_then(|_| sink.flush());
            if let Err(e) = res {
                log::debug!("output pump stopped: {e}");
            }
        })
    }

    /// Decodes log records from the child and hands them to `handler`.
    pub(crate) fn log(&mut self, pipe: File, handler: LogHandler) -> io::Result<()> {
        self.spawn("log", move || {
            let n = LogReader::new(pipe).forward_to(&handler);
            log::debug!("forwarded {n} log records");
        })
    }

    /// Blocks until every pump has finished.
    pub(crate) fn join(self) {
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or_default().to_string();
            if handle.join().is_err() {
                log::warn!("{name} panicked");
            }
        }
    }
}
