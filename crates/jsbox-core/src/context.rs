use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::debug;

use crate::callback::{binding_path, CallContext, CallbackError};
use crate::controller::Command;
use crate::error::{Error, Result};
use crate::execution::{Callee, ExecutionRequest, ExecutionResult, PendingExecution, Work};
use crate::isolate::{Isolate, IsolateId, IsolateInner};
use crate::value::{FunctionRef, HostValue};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextInfo {
    pub id: ContextId,
    pub isolate: IsolateId,
    /// Milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub bindings: Vec<String>,
    pub live_functions: usize,
}

struct ContextState {
    id: ContextId,
    isolate: Arc<IsolateInner>,
    created_at: SystemTime,
    /// Held while handing work to the engine so that nothing is queued
    /// behind this context's disposal.
    disposed: Mutex<bool>,
}

impl ContextState {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.disposed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ContextState {
    fn drop(&mut self) {
        if !*self.lock() {
            let _ = self.isolate.send(Command::DisposeContext { id: self.id, reply: None });
        }
    }
}

/// A global scope inside an [`Isolate`]. Executions on a context (and on all
/// contexts of the same isolate) run one at a time, in submission order.
#[derive(Clone)]
pub struct Context {
    state: Arc<ContextState>,
}

impl Context {
    pub fn new(isolate: &Isolate) -> Result<Self> {
        let id = ContextId::next();
        isolate
            .inner
            .request(true, |reply| Command::CreateContext { id, reply })??;
        debug!(isolate = isolate.id().get(), context = id.get(), "Context created");
        Ok(Self {
            state: Arc::new(ContextState {
                id,
                isolate: Arc::clone(&isolate.inner),
                created_at: SystemTime::now(),
                disposed: Mutex::new(false),
            }),
        })
    }

    pub fn id(&self) -> ContextId {
        self.state.id
    }

    pub fn isolate_id(&self) -> IsolateId {
        self.state.isolate.id()
    }

    pub fn created_at(&self) -> SystemTime {
        self.state.created_at
    }

    pub fn is_disposed(&self) -> bool {
        *self.state.lock()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Binds `function` as a global, e.g. `add` or `host.math.add`.
    /// Rebinding a name replaces the previous function before the next
    /// execution starts.
    pub fn bind<F>(&self, name: &str, function: F) -> Result<()>
    where
        F: Fn(
                &mut CallContext<'_, '_>,
                Vec<HostValue>,
            ) -> std::result::Result<HostValue, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        binding_path(name)?;
        self.ensure_live()?;
        let name = name.to_string();
        let context = self.id();
        self.state.isolate.request(true, move |reply| Command::Bind {
            context,
            name,
            function: Arc::new(function),
            reply,
        })?
    }

    /// Removes a binding. Returns false if nothing was bound under `name`.
    pub fn unbind(&self, name: &str) -> Result<bool> {
        binding_path(name)?;
        self.ensure_live()?;
        let name = name.to_string();
        let context = self.id();
        self.state
            .isolate
            .request(true, move |reply| Command::Unbind { context, name, reply })?
    }

    /// Queues `request` and returns immediately.
    pub fn submit(&self, request: ExecutionRequest) -> Result<PendingExecution> {
        if let Work::Call { callee: Callee::Function(function), .. } = &request.work {
            self.check_owned(function)?;
        }
        let disposed = self.state.lock();
        if *disposed {
            return Err(Error::Disposed);
        }
        let slot = self.state.isolate.submit(self.id(), request)?;
        drop(disposed);
        Ok(PendingExecution { slot, isolate: Arc::clone(&self.state.isolate) })
    }

    /// Runs `request` and waits for its result.
    pub fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        if self.state.isolate.on_engine_thread() {
            return Err(Error::WouldDeadlock);
        }
        Ok(self.submit(request)?.wait())
    }

    pub fn eval(&self, source: &str) -> Result<ExecutionResult> {
        self.execute(ExecutionRequest::eval(source))
    }

    pub fn eval_with_timeout(&self, source: &str, timeout: Duration) -> Result<ExecutionResult> {
        self.execute(ExecutionRequest::eval(source).with_timeout(timeout))
    }

    pub fn call(&self, callee: impl Into<Callee>, args: Vec<HostValue>) -> Result<ExecutionResult> {
        self.execute(ExecutionRequest::call(callee, args))
    }

    pub fn call_with_timeout(
        &self,
        callee: impl Into<Callee>,
        args: Vec<HostValue>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        self.execute(ExecutionRequest::call(callee, args).with_timeout(timeout))
    }

    /// Evaluates a script file.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<ExecutionResult> {
        let source = fs::read_to_string(path.as_ref())?;
        self.eval(&source)
    }

    /// Drops the engine handle behind a copied-out function. Later calls
    /// through `function` fail with a `ReferenceError`.
    pub fn release(&self, function: &FunctionRef) -> Result<()> {
        self.check_owned(function)?;
        self.ensure_live()?;
        self.state
            .isolate
            .send(Command::ReleaseFunction { context: function.context(), id: function.id })
    }

    pub fn info(&self) -> Result<ContextInfo> {
        self.ensure_live()?;
        let context = self.id();
        let (bindings, live_functions) = self
            .state
            .isolate
            .request(false, |reply| Command::Describe { context, reply })?
            .ok_or(Error::Disposed)?;
        let created_at_ms = self
            .state
            .created_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(ContextInfo {
            id: context,
            isolate: self.isolate_id(),
            created_at_ms,
            bindings,
            live_functions,
        })
    }

    /// Frees the engine context, its bindings and function arena. Work
    /// already queued on it still runs first. Idempotent.
    pub fn dispose(&self) {
        let response = {
            let mut disposed = self.state.lock();
            if *disposed {
                return;
            }
            *disposed = true;
            if self.state.isolate.on_engine_thread() {
                let command = Command::DisposeContext { id: self.id(), reply: None };
                let _ = self.state.isolate.send(command);
                return;
            }
            let (reply, response) = mpsc::channel();
            let command = Command::DisposeContext { id: self.id(), reply: Some(reply) };
            if self.state.isolate.send(command).is_err() {
                // The isolate is gone and took the engine context with it.
                return;
            }
            response
        };
        let _ = response.recv();
    }

    fn check_owned(&self, function: &FunctionRef) -> Result<()> {
        if function.isolate() != self.isolate_id() {
            return Err(Error::InvalidHandle(format!(
                "{} belongs to {}, not {}",
                function,
                function.isolate(),
                self.isolate_id()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("isolate", &self.isolate_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
