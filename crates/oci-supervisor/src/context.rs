//! The runtime context: configuration plus the runtime every call goes through.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::RuntimeConfig;
use crate::container::Container;
use crate::error::{Error, Result, RuntimeError};
use crate::logging::{LogHandler, LogOutput, LogRegistry};
use crate::runtime::{ContainerRuntime, CreateOptions, RunOptions, RuntimeEnv};
use crate::spec::ContainerSpec;
use crate::supervisor::{self, ChildHandle, IoConfig};

/// The part of the context guarded by its mutex.
#[derive(Debug)]
struct ContextBlock {
    config: RuntimeConfig,
    /// Container targeted by the call in progress or the last one made
    id: String,
}

/// Execution environment for container operations.
///
/// Each call records its target container id in the context before it reaches
/// the runtime, so calls made through the same context are serialised. Use one
/// context per thread to run operations concurrently.
///
/// [`close`](RuntimeContext::close) releases the context. Every later
/// operation fails with [`ErrorKind::InvalidArgument`](crate::ErrorKind::InvalidArgument).
pub struct RuntimeContext {
    block: Mutex<Option<ContextBlock>>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<LogRegistry>,
    handler: Option<LogHandler>,
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("runtime", &self.runtime.name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A container started by [`RuntimeContext::run_with_io`].
#[derive(Debug)]
pub struct Launched<'a> {
    pub container: Container<'a>,
    pub child: ChildHandle,
}

impl Launched<'_> {
    /// Waits for the supervised child, see [`ChildHandle::wait`].
    pub fn wait(self) -> Result<i32> {
        self.child.wait()
    }
}

impl RuntimeContext {
    pub fn new(config: RuntimeConfig, runtime: impl ContainerRuntime + 'static) -> Self {
        Self::with_runtime(config, Arc::new(runtime))
    }

    pub fn with_runtime(config: RuntimeConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            block: Mutex::new(Some(ContextBlock {
                config,
                id: String::new(),
            })),
            runtime,
            registry: LogRegistry::global(),
            handler: None,
        }
    }

    /// Sends the runtime diagnostics of this context to `handler` instead of
    /// the registry's handler.
    pub fn with_log_handler(mut self, handler: LogHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Uses `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: Arc<LogRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn log_registry(&self) -> &Arc<LogRegistry> {
        &self.registry
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    pub fn config(&self) -> Result<RuntimeConfig> {
        let block = self.lock();
        let block = block.as_ref().ok_or_else(Error::invalid_context)?;
        Ok(block.config.clone())
    }

    /// Id of the container targeted by the most recent call.
    pub fn current_id(&self) -> Result<String> {
        let block = self.lock();
        let block = block.as_ref().ok_or_else(Error::invalid_context)?;
        Ok(block.id.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Releases the context. Closing an already closed context is an error.
    pub fn close(&self) -> Result<()> {
        match self.lock().take() {
            Some(_) => Ok(()),
            None => Err(Error::invalid_context()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ContextBlock>> {
        self.block.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    /// The handler for diagnostics of this context, if any.
    pub(crate) fn log_handler(&self) -> Option<LogHandler> {
        self.handler.clone().or_else(|| self.registry.current())
    }

    /// Records `id` as the target and runs `f` while the context is locked.
    pub(crate) fn with_target<T>(
        &self,
        id: &str,
        f: impl FnOnce(&RuntimeConfig, &str) -> Result<T>,
    ) -> Result<T> {
        let mut block = self.lock();
        let block = block.as_mut().ok_or_else(Error::invalid_context)?;
        block.id.clear();
        block.id.push_str(id);
        f(&block.config, &block.id)
    }

    /// Issues one runtime call for container `id`. Its failure is classified here.
    pub(crate) fn call<T>(
        &self,
        id: &str,
        f: impl FnOnce(&dyn ContainerRuntime, RuntimeEnv) -> Result<T, RuntimeError>,
    ) -> Result<T> {
        let handler = self
            .log_handler()
            .unwrap_or_else(LogHandler::forward_to_log);
        let log = LogOutput::handler(handler, self.registry.verbosity());
        self.with_target(id, |config, id| {
            let env = RuntimeEnv {
                config,
                id,
                log: &log,
            };
            Ok(f(self.runtime.as_ref(), env)?)
        })
    }

    /// Creates container `id` without starting it.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(spec), level = "Info"))]
    pub fn create(&self, id: &str, spec: &ContainerSpec, opts: CreateOptions) -> Result<Container<'_>> {
        let spec = spec.spec()?;
        self.call(id, |rt, env| rt.create(env, spec, opts))?;
        Ok(Container::new(id, self))
    }

    /// Runs container `id` to completion in the calling process and returns its
    /// exit code. The container shares the caller's standard streams.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(spec), level = "Info"))]
    pub fn run(&self, id: &str, spec: &ContainerSpec, opts: RunOptions) -> Result<i32> {
        let spec = spec.spec()?;
        self.call(id, |rt, env| rt.run(env, spec, opts))
    }

    /// Runs container `id` in a supervised child process with the streams
    /// described by `io`.
    pub fn run_with_io(&self, id: &str, spec: &ContainerSpec, io: IoConfig) -> Result<Launched<'_>> {
        self.launch(id, spec, RunOptions::default(), io)
    }

    /// Like [`run_with_io`](RuntimeContext::run_with_io), with explicit run options.
    pub fn launch(
        &self,
        id: &str,
        spec: &ContainerSpec,
        opts: RunOptions,
        io: IoConfig,
    ) -> Result<Launched<'_>> {
        let child = supervisor::launch_isolated(self, id, spec, opts, io)?;
        Ok(Launched {
            container: Container::new(id, self),
            child,
        })
    }

    /// A handle to container `id`. Its existence is not checked.
    pub fn get(&self, id: &str) -> Result<Container<'_>> {
        if self.is_closed() {
            return Err(Error::invalid_context());
        }
        Ok(Container::new(id, self))
    }

    pub fn list(&self) -> Result<Vec<Container<'_>>> {
        let ids = self.list_ids()?;
        Ok(ids.into_iter().map(|id| Container::new(id, self)).collect())
    }

    pub fn list_ids(&self) -> Result<Vec<String>> {
        self.call("", |rt, env| rt.list(env))
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        let block = self
            .block
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if block.take().is_some() {
            log::debug!("runtime context dropped without being closed");
        }
    }
}
