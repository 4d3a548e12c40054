use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::IsolateConfig;
use crate::context::{Context, ContextId};
use crate::controller::{Command, Engine};
use crate::error::{Error, Result};
use crate::execution::{
    ExecutionRequest, ExecutionResult, ExecutionSlot, InFlight, Job, TerminationReason,
};
use crate::platform;
use crate::watchdog::WatchShared;

static NEXT_ISOLATE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IsolateId(u64);

impl IsolateId {
    fn next() -> Self {
        Self(NEXT_ISOLATE.fetch_add(1, Ordering::Relaxed))
    }

    /// Id that matches no live isolate.
    pub(crate) fn detached() -> Self {
        Self(0)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IsolateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "isolate#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum IsolateStatus {
    Ready,
    /// Heap exhausted or internal fault. Only disposal remains.
    Unusable(String),
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisposePolicy {
    /// Let queued and running executions finish first.
    #[default]
    Wait,
    FailIfBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HeapStats {
    pub total_heap_size: usize,
    pub used_heap_size: usize,
    pub total_physical_size: usize,
    pub total_available_size: usize,
    pub heap_size_limit: usize,
    pub malloced_memory: usize,
    pub external_memory: usize,
    pub native_contexts: usize,
    pub detached_contexts: usize,
}

/// Status shared with the engine thread.
pub(crate) struct IsolateShared {
    id: IsolateId,
    status: Mutex<IsolateStatus>,
    in_flight: Arc<InFlight>,
}

impl IsolateShared {
    fn new(id: IsolateId) -> Self {
        Self {
            id,
            status: Mutex::new(IsolateStatus::Ready),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IsolateStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> IsolateId {
        self.id
    }

    pub fn status(&self) -> IsolateStatus {
        self.lock().clone()
    }

    pub fn unusable_reason(&self) -> Option<String> {
        match &*self.lock() {
            IsolateStatus::Unusable(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Returns false if the isolate was already unusable or disposed.
    pub fn mark_unusable(&self, reason: String) -> bool {
        let mut status = self.lock();
        if *status != IsolateStatus::Ready {
            return false;
        }
        *status = IsolateStatus::Unusable(reason);
        true
    }

    fn mark_disposed(&self) {
        *self.lock() = IsolateStatus::Disposed;
    }
}

#[derive(Debug, Clone, Copy)]
struct ExecutionDefaults {
    timeout: Option<Duration>,
    max_memory_delta: Option<usize>,
}

pub(crate) struct IsolateInner {
    shared: Arc<IsolateShared>,
    watch: Arc<WatchShared>,
    defaults: ExecutionDefaults,
    commands: Mutex<Option<Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl IsolateInner {
    pub fn id(&self) -> IsolateId {
        self.shared.id()
    }

    pub fn watch(&self) -> &Arc<WatchShared> {
        &self.watch
    }

    pub fn on_engine_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn lock_commands(&self) -> MutexGuard<'_, Option<Sender<Command>>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ensure_usable(&self) -> Result<()> {
        match self.shared.status() {
            IsolateStatus::Ready => Ok(()),
            IsolateStatus::Unusable(reason) => Err(Error::Unusable(reason)),
            IsolateStatus::Disposed => Err(Error::Disposed),
        }
    }

    /// Queues a command without waiting for it.
    pub fn send(&self, command: Command) -> Result<()> {
        let commands = self.lock_commands();
        let Some(sender) = commands.as_ref() else {
            return Err(Error::Disposed);
        };
        sender.send(command).map_err(|_| engine_gone())
    }

    /// Queues a command and blocks for its reply.
    pub fn request<T>(
        &self,
        usable_only: bool,
        make: impl FnOnce(Sender<T>) -> Command,
    ) -> Result<T> {
        if self.on_engine_thread() {
            return Err(Error::WouldDeadlock);
        }
        if usable_only {
            self.ensure_usable()?;
        }
        let (reply, response) = mpsc::channel();
        self.send(make(reply))?;
        response.recv().map_err(|_| engine_gone())
    }

    pub fn submit(
        &self,
        context: ContextId,
        mut request: ExecutionRequest,
    ) -> Result<Arc<ExecutionSlot>> {
        self.ensure_usable()?;
        request.timeout = request.timeout.or(self.defaults.timeout);
        request.max_memory_delta = request.max_memory_delta.or(self.defaults.max_memory_delta);

        let commands = self.lock_commands();
        let Some(sender) = commands.as_ref() else {
            return Err(Error::Disposed);
        };
        let job = Job::new(request, &self.shared.in_flight);
        let slot = Arc::clone(&job.slot);
        sender.send(Command::Execute { context, job }).map_err(|_| engine_gone())?;
        Ok(slot)
    }

    fn force_terminate_all(&self) -> usize {
        let slots = self.shared.in_flight.slots();
        let mut terminated = 0;
        for slot in &slots {
            let cancelled = ExecutionResult::Terminated(TerminationReason::Cancelled);
            if slot.complete_if_pending(cancelled)
                || self.watch.terminate(Some(slot.id()), TerminationReason::Cancelled)
            {
                terminated += 1;
            }
        }
        if !self.on_engine_thread() {
            for slot in &slots {
                slot.wait();
            }
        }
        terminated
    }

    fn dispose(&self, policy: DisposePolicy) -> Result<()> {
        if self.on_engine_thread() {
            return Err(Error::WouldDeadlock);
        }
        let sender = {
            let mut commands = self.lock_commands();
            if commands.is_some() && policy == DisposePolicy::FailIfBusy {
                let active = self.shared.in_flight.len();
                if active > 0 {
                    return Err(Error::Busy { active });
                }
            }
            commands.take()
        };
        // Shutdown queues behind everything already accepted.
        if let Some(sender) = sender {
            let _ = sender.send(Command::Shutdown);
        }
        self.join_engine();
        if self.shared.status() != IsolateStatus::Disposed {
            self.shared.mark_disposed();
            info!(isolate = self.id().get(), "Isolate disposed");
        }
        Ok(())
    }

    fn join_engine(&self) {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = thread.take() {
            if handle.join().is_err() {
                warn!(isolate = self.id().get(), "Engine thread panicked during shutdown");
            }
        }
    }
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        if self.lock_commands().is_none() {
            return;
        }
        // Nobody can observe outstanding results any more.
        self.force_terminate_all();
        if let Some(sender) = self.lock_commands().take() {
            let _ = sender.send(Command::Shutdown);
        }
        if self.on_engine_thread() {
            // The last handle died inside a host function; the engine thread
            // finishes the queue and exits on its own.
            return;
        }
        self.join_engine();
        self.shared.mark_disposed();
    }
}

fn engine_gone() -> Error {
    Error::Unusable("engine thread has exited".into())
}

/// Handle to an engine isolate running on its own thread. Cloning is cheap;
/// the isolate is shut down by [`Isolate::dispose`] or when the last handle
/// (including contexts and pending executions) is dropped.
#[derive(Clone)]
pub struct Isolate {
    pub(crate) inner: Arc<IsolateInner>,
}

impl Isolate {
    pub fn new(config: IsolateConfig) -> Result<Self> {
        config.validate()?;
        let platform = platform::acquire()?;
        let id = IsolateId::next();
        let shared = Arc::new(IsolateShared::new(id));
        let defaults = ExecutionDefaults {
            timeout: config.default_timeout,
            max_memory_delta: config.default_max_memory_delta,
        };
        let max_heap_mb = config.max_heap_mb;

        let (commands, queue) = mpsc::channel();
        let (ready, started) = mpsc::sync_channel(1);
        let engine_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("jsbox-isolate-{}", id.get()))
            .spawn(move || {
                let engine = match Engine::new(engine_shared, &config, platform) {
                    Ok(engine) => engine,
                    Err(err) => {
                        let _ = ready.send(Err(err));
                        return;
                    }
                };
                drop(config);
                if ready.send(Ok(Arc::clone(engine.watch()))).is_ok() {
                    engine.serve(queue);
                }
            })
            .map_err(|err| Error::EngineInit(format!("failed to spawn engine thread: {}", err)))?;

        let watch = match started.recv() {
            Ok(Ok(watch)) => watch,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::EngineInit("engine thread exited during start-up".into()));
            }
        };

        info!(isolate = id.get(), max_heap_mb, "Isolate created");
        let thread_id = thread.thread().id();
        Ok(Self {
            inner: Arc::new(IsolateInner {
                shared,
                watch,
                defaults,
                commands: Mutex::new(Some(commands)),
                thread: Mutex::new(Some(thread)),
                thread_id,
            }),
        })
    }

    pub fn id(&self) -> IsolateId {
        self.inner.id()
    }

    pub fn create_context(&self) -> Result<Context> {
        Context::new(self)
    }

    /// Last sampled usage in bytes, external memory included. Never blocks.
    pub fn heap_usage(&self) -> usize {
        self.inner.watch.heap_used()
    }

    /// The configured ceiling. It is fixed for the isolate's lifetime.
    pub fn max_heap_bytes(&self) -> usize {
        self.inner.watch.max_heap_bytes()
    }

    /// Precise statistics, taken on the engine thread after queued work.
    pub fn heap_stats(&self) -> Result<HeapStats> {
        self.inner.request(false, |reply| Command::HeapStats { reply })
    }

    pub fn low_memory_notification(&self) -> Result<()> {
        self.inner.request(false, |reply| Command::LowMemoryNotification { reply })
    }

    /// Cancels every queued execution and terminates the running one. Off the
    /// engine thread, returns only once all of them are terminal.
    pub fn force_terminate_all(&self) -> usize {
        let terminated = self.inner.force_terminate_all();
        if terminated > 0 {
            info!(isolate = self.id().get(), terminated, "Terminated all executions");
        }
        terminated
    }

    /// Number of executions queued or running.
    pub fn in_flight(&self) -> usize {
        self.inner.shared.in_flight.len()
    }

    pub fn status(&self) -> IsolateStatus {
        self.inner.shared.status()
    }

    pub fn is_usable(&self) -> bool {
        self.status() == IsolateStatus::Ready
    }

    pub fn dispose(&self, policy: DisposePolicy) -> Result<()> {
        self.inner.dispose(policy)
    }
}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}
