use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::execution::TerminationReason;
use crate::isolate::IsolateId;
use crate::timeout::TimeoutBudget;

/// Extra heap handed to the engine after the ceiling is hit, so the
/// termination can unwind instead of aborting the process.
const MIN_UNWIND_HEADROOM: usize = 4 * 1024 * 1024;

/// Room above the ceiling for one oversized allocation to land, so the
/// sampler can terminate the script instead of the engine aborting on it.
const ALLOCATION_SLACK: usize = 32 * 1024 * 1024;

/// Limit handed to the engine itself. The configured ceiling is enforced by
/// `sample_heap` and the engine limit only backs it up.
pub(crate) fn engine_heap_limit(max_heap_bytes: usize) -> usize {
    max_heap_bytes.saturating_add(max_heap_bytes.max(ALLOCATION_SLACK))
}

/// Bytes charged against the ceiling: the managed heap plus external
/// memory such as array buffer backing stores.
pub(crate) fn memory_footprint(stats: &v8::HeapStatistics) -> usize {
    stats.used_heap_size().saturating_add(stats.external_memory())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemoryBudget {
    pub baseline: usize,
    pub max_delta: usize,
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    execution: u64,
    timeout: Option<TimeoutBudget>,
    memory: Option<MemoryBudget>,
}

#[derive(Debug, Default)]
struct WatchState {
    active: Option<Watch>,
    verdict: Option<TerminationReason>,
    heap_exhausted: bool,
    headroom_granted: usize,
    shutdown: bool,
}

/// State shared between the engine thread, the watchdog thread, cancellers
/// and the engine's own heap/interrupt callbacks. Every termination request
/// is issued while holding `state`, and disarming takes the same lock, so a
/// termination aimed at one execution can never land on the next one.
pub(crate) struct WatchShared {
    isolate: IsolateId,
    state: Mutex<WatchState>,
    wake: Condvar,
    handle: v8::IsolateHandle,
    heap_used: AtomicUsize,
    max_heap_bytes: usize,
}

impl WatchShared {
    pub fn new(isolate: IsolateId, handle: v8::IsolateHandle, max_heap_bytes: usize) -> Self {
        Self {
            isolate,
            state: Mutex::new(WatchState::default()),
            wake: Condvar::new(),
            handle,
            heap_used: AtomicUsize::new(0),
            max_heap_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Terminates the active execution (or only `execution`, when given) and
    /// records `reason` unless another reason was recorded first.
    pub fn terminate(&self, execution: Option<u64>, reason: TerminationReason) -> bool {
        let mut state = self.lock();
        let Some(active) = state.active else {
            return false;
        };
        if execution.is_some_and(|id| id != active.execution) {
            return false;
        }
        if state.verdict.is_none() {
            state.verdict = Some(reason);
        }
        self.handle.terminate_execution();
        true
    }

    /// Reason recorded for the active execution, without consuming it.
    pub fn verdict(&self) -> Option<TerminationReason> {
        self.lock().verdict
    }

    pub fn heap_exhausted(&self) -> bool {
        self.lock().heap_exhausted
    }

    pub fn heap_used(&self) -> usize {
        self.heap_used.load(Ordering::Relaxed)
    }

    pub fn record_heap_used(&self, used: usize) {
        self.heap_used.store(used, Ordering::Relaxed);
    }

    pub fn max_heap_bytes(&self) -> usize {
        self.max_heap_bytes
    }

    fn as_callback_data(self: &Arc<Self>) -> *mut c_void {
        Arc::as_ptr(self) as *mut c_void
    }
}

/// Per-isolate watchdog: one persistent thread that enforces the deadline and
/// memory budget of whichever execution is currently armed.
pub(crate) struct Watchdog {
    shared: Arc<WatchShared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(shared: Arc<WatchShared>, sample_interval: Duration) -> std::io::Result<Self> {
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("jsbox-watchdog-{}", shared.isolate.get()))
            .spawn(move || watch_loop(thread_shared, sample_interval))?;
        Ok(Self { shared, thread: Some(thread) })
    }

    pub fn shared(&self) -> &Arc<WatchShared> {
        &self.shared
    }

    pub fn arm(&self, execution: u64, timeout: Option<Duration>, memory: Option<MemoryBudget>) {
        let mut state = self.shared.lock();
        state.active = Some(Watch { execution, timeout: timeout.map(TimeoutBudget::new), memory });
        state.verdict = None;
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Stops watching and returns the termination reason, if any fired.
    pub fn disarm(&self) -> Option<TerminationReason> {
        let mut state = self.shared.lock();
        state.active = None;
        let verdict = state.verdict.take();
        drop(state);
        self.shared.wake.notify_all();
        verdict
    }

    /// Installs the engine callbacks that report back into this watchdog. The
    /// shared state outlives the isolate because the engine thread drops the
    /// isolate before the watchdog.
    pub fn install(&self, isolate: &mut v8::Isolate) {
        isolate.add_near_heap_limit_callback(near_heap_limit, self.shared.as_callback_data());
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch_loop(shared: Arc<WatchShared>, sample_interval: Duration) {
    let mut state = shared.lock();
    loop {
        state = shared
            .wake
            .wait_while(state, |s| s.active.is_none() && !s.shutdown)
            .unwrap_or_else(PoisonError::into_inner);
        if state.shutdown {
            break;
        }
        let Some(watch) = state.active else {
            continue;
        };

        let now = Instant::now();
        if let Some(timeout) = watch.timeout {
            if timeout.expired_at(now) {
                if state.verdict.is_none() {
                    state.verdict = Some(TerminationReason::Timeout);
                    debug!(
                        isolate = shared.isolate.get(),
                        execution = watch.execution,
                        budget_ms = timeout.budget().as_millis() as u64,
                        "Execution deadline reached"
                    );
                }
                shared.handle.terminate_execution();
                // Nothing left to watch until the controller re-arms.
                state = shared
                    .wake
                    .wait_while(state, |s| {
                        s.active.map(|w| w.execution) == Some(watch.execution) && !s.shutdown
                    })
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
        }

        // Heap statistics can only be read on the engine thread, so the
        // sample is taken by an interrupt at the next safe point.
        if state.verdict.is_none() {
            drop(state);
            shared.handle.request_interrupt(sample_heap, shared.as_callback_data());
            state = shared.lock();
        }

        let mut wait = sample_interval;
        if let Some(remaining) = watch.timeout.and_then(|t| t.remaining_at(Instant::now())) {
            wait = wait.min(remaining);
        }
        let (guard, _) = shared
            .wake
            .wait_timeout_while(state, wait, |s| {
                s.active.map(|w| w.execution) == Some(watch.execution) && !s.shutdown
            })
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
    }
}

extern "C" fn sample_heap(isolate: &mut v8::Isolate, data: *mut c_void) {
    // SAFETY: `data` is `Arc::as_ptr` of the isolate's WatchShared, which the
    // engine thread keeps alive until after the isolate has been dropped.
    let shared = unsafe { &*(data as *const WatchShared) };
    let mut stats = v8::HeapStatistics::default();
    isolate.get_heap_statistics(&mut stats);
    if memory_footprint(&stats) > shared.max_heap_bytes {
        // Unreachable buffers are only uncounted after a collection. The
        // state lock is not held here because a full GC may re-enter
        // `near_heap_limit`.
        isolate.low_memory_notification();
        isolate.get_heap_statistics(&mut stats);
    }
    let used = memory_footprint(&stats);
    shared.record_heap_used(used);

    let mut state = shared.lock();
    let Some(watch) = state.active else {
        return;
    };
    if state.verdict.is_some() {
        return;
    }
    if used > shared.max_heap_bytes {
        state.heap_exhausted = true;
        state.verdict = Some(TerminationReason::MemoryLimit);
        warn!(
            isolate = shared.isolate.get(),
            execution = watch.execution,
            used,
            external = stats.external_memory(),
            max_heap_bytes = shared.max_heap_bytes,
            "Isolate exceeded its memory ceiling; terminating"
        );
        isolate.terminate_execution();
        return;
    }
    let Some(budget) = watch.memory else {
        return;
    };
    if used.saturating_sub(budget.baseline) > budget.max_delta {
        state.verdict = Some(TerminationReason::MemoryLimit);
        warn!(
            isolate = shared.isolate.get(),
            execution = watch.execution,
            used,
            baseline = budget.baseline,
            max_delta = budget.max_delta,
            "Execution exceeded its memory budget"
        );
        isolate.terminate_execution();
    }
}

extern "C" fn near_heap_limit(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: see `sample_heap`.
    let shared = unsafe { &*(data as *const WatchShared) };
    let mut state = shared.lock();
    state.heap_exhausted = true;
    if state.active.is_some() && state.verdict.is_none() {
        state.verdict = Some(TerminationReason::MemoryLimit);
    }
    shared.handle.terminate_execution();

    let grant = unwind_grant(current_heap_limit, shared.max_heap_bytes, state.headroom_granted);
    state.headroom_granted += grant;
    warn!(
        isolate = shared.isolate.get(),
        current_heap_limit,
        grant,
        "Isolate reached its heap ceiling; terminating"
    );
    current_heap_limit + grant
}

/// Headroom is only for unwinding the terminated script. It comes out of a
/// fixed allowance equal to the configured ceiling and is never replenished.
fn unwind_grant(current_heap_limit: usize, max_heap_bytes: usize, already_granted: usize) -> usize {
    let allowance = max_heap_bytes.saturating_sub(already_granted);
    (current_heap_limit / 4).max(MIN_UNWIND_HEADROOM).min(allowance)
}
