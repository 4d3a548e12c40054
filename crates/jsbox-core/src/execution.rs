use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::error::Error;
use crate::isolate::IsolateInner;
use crate::value::{FunctionRef, HostValue};

static NEXT_EXECUTION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Timeout,
    MemoryLimit,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Timeout => "timeout",
            TerminationReason::MemoryLimit => "memory_limit",
            TerminationReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    /// The source failed to compile.
    Syntax,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptException {
    pub kind: ExceptionKind,
    pub message: String,
    pub backtrace: Option<String>,
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(backtrace) = &self.backtrace {
            write!(f, "\n{}", backtrace)?;
        }
        Ok(())
    }
}

/// The single outcome of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success(HostValue),
    JavaScriptException(ScriptException),
    Terminated(TerminationReason),
    /// The engine failed internally; the owning isolate must not be reused.
    EngineFailure(String),
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn value(&self) -> Option<&HostValue> {
        match self {
            ExecutionResult::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<HostValue> {
        match self {
            ExecutionResult::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn exception(&self) -> Option<&ScriptException> {
        match self {
            ExecutionResult::JavaScriptException(exception) => Some(exception),
            _ => None,
        }
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        match self {
            ExecutionResult::Terminated(reason) => Some(*reason),
            _ => None,
        }
    }

    fn terminal_state(&self) -> ExecutionState {
        match self {
            ExecutionResult::Terminated(TerminationReason::Timeout) => ExecutionState::TimedOut,
            ExecutionResult::Terminated(TerminationReason::MemoryLimit) => {
                ExecutionState::MemoryExceeded
            }
            ExecutionResult::Terminated(TerminationReason::Cancelled) => ExecutionState::Cancelled,
            _ => ExecutionState::Completed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    TimedOut,
    MemoryExceeded,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionState::Pending | ExecutionState::Running)
    }
}

/// What to call: a function copied out earlier, or a dotted global path such
/// as `"JSON.stringify"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    Global(String),
    Function(FunctionRef),
}

impl From<&str> for Callee {
    fn from(path: &str) -> Self {
        Callee::Global(path.to_string())
    }
}

impl From<String> for Callee {
    fn from(path: String) -> Self {
        Callee::Global(path)
    }
}

impl From<FunctionRef> for Callee {
    fn from(function: FunctionRef) -> Self {
        Callee::Function(function)
    }
}

impl From<&FunctionRef> for Callee {
    fn from(function: &FunctionRef) -> Self {
        Callee::Function(function.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    Eval { source: String },
    Call { callee: Callee, args: Vec<HostValue> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub work: Work,
    /// Falls back to the isolate's default timeout; `None` there means unlimited.
    pub timeout: Option<Duration>,
    /// Heap growth allowed during this execution, in bytes.
    pub max_memory_delta: Option<usize>,
}

impl ExecutionRequest {
    pub fn eval(source: impl Into<String>) -> Self {
        Self { work: Work::Eval { source: source.into() }, timeout: None, max_memory_delta: None }
    }

    pub fn call(callee: impl Into<Callee>, args: Vec<HostValue>) -> Self {
        Self {
            work: Work::Call { callee: callee.into(), args },
            timeout: None,
            max_memory_delta: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_memory_delta(mut self, bytes: usize) -> Self {
        self.max_memory_delta = Some(bytes);
        self
    }
}

struct SlotInner {
    state: ExecutionState,
    result: Option<ExecutionResult>,
}

/// Rendezvous between the submitter and the engine thread for one request.
/// The result is written exactly once; every later completion attempt is
/// ignored.
pub(crate) struct ExecutionSlot {
    id: u64,
    inner: Mutex<SlotInner>,
    done: Condvar,
}

impl ExecutionSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_EXECUTION.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(SlotInner { state: ExecutionState::Pending, result: None }),
            done: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ExecutionState {
        self.lock().state
    }

    /// `Pending -> Running`. False when the request was already finished,
    /// e.g. cancelled while it sat in the queue.
    pub fn begin(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != ExecutionState::Pending {
            return false;
        }
        inner.state = ExecutionState::Running;
        true
    }

    pub fn complete(&self, result: ExecutionResult) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = result.terminal_state();
        inner.result = Some(result);
        drop(inner);
        self.done.notify_all();
        true
    }

    /// Finishes a request that has not started yet.
    pub fn complete_if_pending(&self, result: ExecutionResult) -> bool {
        let mut inner = self.lock();
        if inner.state != ExecutionState::Pending {
            return false;
        }
        inner.state = result.terminal_state();
        inner.result = Some(result);
        drop(inner);
        self.done.notify_all();
        true
    }

    pub fn wait(&self) -> ExecutionResult {
        let inner = self
            .done
            .wait_while(self.lock(), |inner| inner.result.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match &inner.result {
            Some(result) => result.clone(),
            None => ExecutionResult::EngineFailure("execution finished without a result".into()),
        }
    }

    pub fn try_result(&self) -> Option<ExecutionResult> {
        self.lock().result.clone()
    }
}

/// Requests that have been accepted by an isolate and not yet dropped by its
/// engine thread.
#[derive(Default)]
pub(crate) struct InFlight {
    slots: Mutex<HashMap<u64, Arc<ExecutionSlot>>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<ExecutionSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// In submission order.
    pub fn slots(&self) -> Vec<Arc<ExecutionSlot>> {
        let mut slots: Vec<_> = self.lock().values().cloned().collect();
        slots.sort_by_key(|slot| slot.id());
        slots
    }
}

/// A queued engine job. Dropping one that never ran (the engine thread died,
/// or the queue was torn down) still completes its request.
pub(crate) struct Job {
    pub request: ExecutionRequest,
    pub slot: Arc<ExecutionSlot>,
    in_flight: Arc<InFlight>,
}

impl Job {
    pub fn new(request: ExecutionRequest, in_flight: &Arc<InFlight>) -> Self {
        let slot = ExecutionSlot::new();
        in_flight.lock().insert(slot.id(), Arc::clone(&slot));
        Self { request, slot, in_flight: Arc::clone(in_flight) }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.slot.complete(ExecutionResult::EngineFailure(
            "execution was dropped before it completed".into(),
        ));
        self.in_flight.lock().remove(&self.slot.id());
    }
}

/// Handle to a submitted request.
pub struct PendingExecution {
    pub(crate) slot: Arc<ExecutionSlot>,
    pub(crate) isolate: Arc<IsolateInner>,
}

impl PendingExecution {
    pub fn id(&self) -> u64 {
        self.slot.id()
    }

    pub fn state(&self) -> ExecutionState {
        self.slot.state()
    }

    /// Cancels the request. A queued request is finished immediately; a
    /// running one is interrupted at its next safe point. Returns once the
    /// request is terminal, unless called from the isolate's own engine
    /// thread, where waiting would deadlock.
    pub fn cancel(&self) {
        let cancelled = ExecutionResult::Terminated(TerminationReason::Cancelled);
        if self.slot.complete_if_pending(cancelled) {
            return;
        }
        self.isolate.watch().terminate(Some(self.slot.id()), TerminationReason::Cancelled);
        if !self.isolate.on_engine_thread() {
            self.slot.wait();
        }
    }

    pub fn try_result(&self) -> Option<ExecutionResult> {
        self.slot.try_result()
    }

    /// Blocks until the request is terminal. On the isolate's own engine
    /// thread an unfinished request can never complete, so this returns an
    /// `EngineFailure` at once and leaves the request queued.
    pub fn wait(self) -> ExecutionResult {
        if self.isolate.on_engine_thread() && !self.slot.state().is_terminal() {
            return ExecutionResult::EngineFailure(Error::WouldDeadlock.to_string());
        }
        self.slot.wait()
    }
}

impl fmt::Debug for PendingExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingExecution")
            .field("id", &self.slot.id())
            .field("state", &self.slot.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_completes_exactly_once() {
        let slot = ExecutionSlot::new();
        assert!(slot.begin());
        assert!(slot.complete(ExecutionResult::Success(HostValue::Integer(1))));
        assert!(!slot.complete(ExecutionResult::Terminated(TerminationReason::Timeout)));
        assert_eq!(slot.state(), ExecutionState::Completed);
        assert_eq!(slot.wait(), ExecutionResult::Success(HostValue::Integer(1)));
    }

    #[test]
    fn cancelled_while_pending_never_begins() {
        let slot = ExecutionSlot::new();
        let cancelled = ExecutionResult::Terminated(TerminationReason::Cancelled);
        assert!(slot.complete_if_pending(cancelled));
        assert_eq!(slot.state(), ExecutionState::Cancelled);
        assert!(!slot.begin());
    }

    #[test]
    fn running_slot_is_not_completed_as_pending() {
        let slot = ExecutionSlot::new();
        assert!(slot.begin());
        let cancelled = ExecutionResult::Terminated(TerminationReason::Cancelled);
        assert!(!slot.complete_if_pending(cancelled));
        assert_eq!(slot.state(), ExecutionState::Running);
    }

    #[test]
    fn termination_reasons_map_to_terminal_states() {
        for (reason, state) in [
            (TerminationReason::Timeout, ExecutionState::TimedOut),
            (TerminationReason::MemoryLimit, ExecutionState::MemoryExceeded),
            (TerminationReason::Cancelled, ExecutionState::Cancelled),
        ] {
            let slot = ExecutionSlot::new();
            assert!(slot.begin());
            slot.complete(ExecutionResult::Terminated(reason));
            assert_eq!(slot.state(), state);
        }
    }

    #[test]
    fn dropped_job_completes_with_engine_failure() {
        let in_flight = Arc::new(InFlight::default());
        let job = Job::new(ExecutionRequest::eval("1"), &in_flight);
        let slot = Arc::clone(&job.slot);
        assert_eq!(in_flight.len(), 1);
        drop(job);
        assert!(matches!(slot.try_result(), Some(ExecutionResult::EngineFailure(_))));
        assert_eq!(in_flight.len(), 0);
    }

    #[test]
    fn finished_job_keeps_its_result_when_dropped() {
        let in_flight = Arc::new(InFlight::default());
        let first = Job::new(ExecutionRequest::eval("1"), &in_flight);
        let second = Job::new(ExecutionRequest::eval("2"), &in_flight);
        let ids: Vec<u64> = in_flight.slots().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![first.slot.id(), second.slot.id()]);

        let slot = Arc::clone(&first.slot);
        assert!(slot.begin());
        slot.complete(ExecutionResult::Success(HostValue::Bool(true)));
        drop(first);
        assert_eq!(slot.try_result(), Some(ExecutionResult::Success(HostValue::Bool(true))));
        assert_eq!(in_flight.len(), 1);
        drop(second);
    }

    #[test]
    fn result_serializes_with_outcome_tag() {
        let json = serde_json::to_string(&ExecutionResult::Terminated(TerminationReason::Timeout))
            .unwrap_or_default();
        assert_eq!(json, r#"{"outcome":"terminated","detail":"timeout"}"#);
    }
}
