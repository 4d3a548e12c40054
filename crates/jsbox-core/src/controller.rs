use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, Level};

use crate::callback::{self, panic_message, HostFunction};
use crate::codec::Codec;
use crate::config::IsolateConfig;
use crate::context::ContextId;
use crate::error::{Error, Result};
use crate::events::{SandboxDomain, SandboxEvent};
use crate::execution::{
    Callee, ExceptionKind, ExecutionResult, Job, ScriptException, TerminationReason, Work,
};
use crate::isolate::{HeapStats, IsolateShared};
use crate::platform::PlatformLease;
use crate::registry::{registry, registry_mut, MarshalLimits, Registry};
use crate::watchdog::{
    engine_heap_limit, memory_footprint, MemoryBudget, WatchShared, Watchdog,
};

const MIB: usize = 1024 * 1024;
const STACK_TRACE_FRAMES: i32 = 32;

/// Work for an isolate's engine thread. Commands are processed strictly in
/// the order they were sent.
pub(crate) enum Command {
    CreateContext { id: ContextId, reply: Sender<Result<()>> },
    DisposeContext { id: ContextId, reply: Option<Sender<bool>> },
    Bind { context: ContextId, name: String, function: HostFunction, reply: Sender<Result<()>> },
    Unbind { context: ContextId, name: String, reply: Sender<Result<bool>> },
    Execute { context: ContextId, job: Job },
    ReleaseFunction { context: ContextId, id: u64 },
    Describe { context: ContextId, reply: Sender<Option<(Vec<String>, usize)>> },
    HeapStats { reply: Sender<HeapStats> },
    LowMemoryNotification { reply: Sender<()> },
    Shutdown,
}

/// Owns the engine isolate. Lives on, and never leaves, the engine thread.
pub(crate) struct Engine {
    isolate: v8::OwnedIsolate,
    watchdog: Watchdog,
    shared: Arc<IsolateShared>,
    trace_executions: bool,
    _platform: PlatformLease,
}

impl Engine {
    pub fn new(
        shared: Arc<IsolateShared>,
        config: &IsolateConfig,
        platform: PlatformLease,
    ) -> Result<Self> {
        let id = shared.id();
        let max_heap_bytes = config.max_heap_mb * MIB;
        let mut params = v8::CreateParams::default()
            .heap_limits(config.initial_heap_mb * MIB, engine_heap_limit(max_heap_bytes));
        if let Some(snapshot) = &config.snapshot {
            params = params.snapshot_blob(snapshot.blob().to_vec().into_boxed_slice());
        }
        let mut isolate = v8::Isolate::new(params);
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
        if config.enable_debugger {
            isolate.set_capture_stack_trace_for_uncaught_exceptions(true, STACK_TRACE_FRAMES);
        }

        let watch = Arc::new(WatchShared::new(id, isolate.thread_safe_handle(), max_heap_bytes));
        let watchdog = Watchdog::spawn(Arc::clone(&watch), config.memory_sample_interval)
            .map_err(|err| Error::EngineInit(format!("failed to start watchdog: {}", err)))?;
        watchdog.install(&mut isolate);

        let limits = MarshalLimits {
            max_depth: config.marshal_max_depth,
            max_values: config.marshal_max_values,
            max_bytes: config.marshal_max_bytes,
        };
        isolate.set_slot(Registry::new(id, limits, watch));

        debug!(
            isolate = id.get(),
            max_heap_mb = config.max_heap_mb,
            initial_heap_mb = config.initial_heap_mb,
            snapshot = config.snapshot.is_some(),
            "Engine isolate created"
        );
        Ok(Self {
            isolate,
            watchdog,
            shared,
            trace_executions: config.enable_debugger,
            _platform: platform,
        })
    }

    pub fn watch(&self) -> &Arc<WatchShared> {
        self.watchdog.shared()
    }

    pub fn serve(mut self, commands: Receiver<Command>) {
        let isolate_id = self.shared.id().get();
        while let Ok(command) = commands.recv() {
            match command {
                Command::Shutdown => break,
                Command::Execute { context, job } => self.execute(context, job),
                Command::CreateContext { id, reply } => {
                    let _ = reply.send(self.create_context(id));
                }
                Command::DisposeContext { id, reply } => {
                    let removed = registry_mut(&mut self.isolate)
                        .map(|r| r.remove_context(id))
                        .unwrap_or(false);
                    if removed {
                        debug!(
                            isolate = self.shared.id().get(),
                            context = id.get(),
                            "Context disposed"
                        );
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(removed);
                    }
                }
                Command::Bind { context, name, function, reply } => {
                    let _ = reply.send(self.bind(context, &name, function));
                }
                Command::Unbind { context, name, reply } => {
                    let _ = reply.send(self.unbind(context, &name));
                }
                Command::ReleaseFunction { context, id } => {
                    if let Some(r) = registry_mut(&mut self.isolate) {
                        r.release_function(context, id);
                    }
                }
                Command::Describe { context, reply } => {
                    let info = registry(&self.isolate).and_then(|r| {
                        r.context(context)?;
                        Some((r.binding_names(context), r.function_count(context)))
                    });
                    let _ = reply.send(info);
                }
                Command::HeapStats { reply } => {
                    let _ = reply.send(self.heap_stats());
                }
                Command::LowMemoryNotification { reply } => {
                    self.isolate.low_memory_notification();
                    self.sample_heap();
                    let _ = reply.send(());
                }
            }
        }
        debug!(isolate = isolate_id, "Engine thread stopping");
    }

    fn create_context(&mut self, id: ContextId) -> Result<()> {
        if let Some(reason) = self.shared.unusable_reason() {
            return Err(Error::Unusable(reason));
        }
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let context = v8::Context::new(scope, Default::default());
        let global = v8::Global::new(scope, context);
        match registry_mut(scope) {
            Some(r) => {
                r.insert_context(id, global);
                Ok(())
            }
            None => Err(Error::Unusable("isolate registry is missing".into())),
        }
    }

    fn bind(&mut self, context: ContextId, name: &str, function: HostFunction) -> Result<()> {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let Some(target) = registry(scope).and_then(|r| r.context(context)) else {
            return Err(Error::Disposed);
        };
        let target = v8::Local::new(scope, &target);
        let scope = &mut v8::ContextScope::new(scope, target);
        let registered =
            registry_mut(scope).and_then(|r| r.register_callback(context, name, function));
        let Some(callback) = registered else {
            return Err(Error::Disposed);
        };
        if let Err(err) = callback::install(scope, name, callback) {
            if let Some(r) = registry_mut(scope) {
                r.unregister_callback(context, name);
            }
            return Err(err);
        }
        debug!(
            isolate = self.shared.id().get(),
            context = context.get(),
            binding = name,
            "Host function bound"
        );
        Ok(())
    }

    fn unbind(&mut self, context: ContextId, name: &str) -> Result<bool> {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let Some(target) = registry(scope).and_then(|r| r.context(context)) else {
            return Err(Error::Disposed);
        };
        if registry_mut(scope).and_then(|r| r.unregister_callback(context, name)).is_none() {
            return Ok(false);
        }
        let target = v8::Local::new(scope, &target);
        let scope = &mut v8::ContextScope::new(scope, target);
        callback::uninstall(scope, name)?;
        Ok(true)
    }

    fn execute(&mut self, context: ContextId, job: Job) {
        let slot = Arc::clone(&job.slot);
        let execution = slot.id();
        let isolate = self.shared.id().get();

        if let Some(reason) = self.shared.unusable_reason() {
            let result = if self.watch().heap_exhausted() {
                ExecutionResult::Terminated(TerminationReason::MemoryLimit)
            } else {
                ExecutionResult::EngineFailure(reason)
            };
            slot.complete_if_pending(result);
            return;
        }

        let baseline = self.sample_heap();
        let memory = job
            .request
            .max_memory_delta
            .map(|max_delta| MemoryBudget { baseline, max_delta });

        // Armed before the slot starts running, so that a canceller that
        // observes `Running` always finds this execution on the watchdog.
        self.isolate.cancel_terminate_execution();
        self.watchdog.arm(execution, job.request.timeout, memory);
        if !slot.begin() {
            self.watchdog.disarm();
            self.isolate.cancel_terminate_execution();
            return;
        }

        if self.trace_executions {
            let (kind, size) = match &job.request.work {
                Work::Eval { source } => ("eval", source.len()),
                Work::Call { args, .. } => ("call", args.len()),
            };
            debug!(isolate, context = context.get(), execution, kind, size, "Execution started");
        }

        let started = Instant::now();
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.run(context, &job.request.work)));
        let verdict = self.watchdog.disarm();
        self.isolate.cancel_terminate_execution();
        let elapsed = started.elapsed();
        let heap_exhausted = self.watch().heap_exhausted();

        let result = match (outcome, verdict) {
            (Err(payload), _) => ExecutionResult::EngineFailure(format!(
                "embedding layer panicked: {}",
                panic_message(payload.as_ref())
            )),
            // Partial results of a terminated run are discarded.
            (Ok(_), Some(reason)) => ExecutionResult::Terminated(reason),
            (Ok(_), None) if heap_exhausted => {
                ExecutionResult::Terminated(TerminationReason::MemoryLimit)
            }
            (Ok(result), None) => result,
        };

        // Retire the isolate before the result is visible to waiters.
        self.check_heap();
        if let ExecutionResult::EngineFailure(message) = &result {
            self.mark_unusable(message.clone());
        }
        self.sample_heap();
        self.report(context, execution, &result, elapsed);
        slot.complete(result);
    }

    fn run(&mut self, context: ContextId, work: &Work) -> ExecutionResult {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let Some(target) = registry(scope).and_then(|r| r.context(context)) else {
            let message = format!("context {} has no engine context", context);
            return ExecutionResult::EngineFailure(message);
        };
        let target = v8::Local::new(scope, &target);
        let scope = &mut v8::ContextScope::new(scope, target);
        evaluate(scope, context, work, true)
    }

    fn report(
        &self,
        context: ContextId,
        execution: u64,
        result: &ExecutionResult,
        elapsed: Duration,
    ) {
        let isolate = self.shared.id().get();
        let elapsed_ms = elapsed.as_millis() as u64;
        match result {
            ExecutionResult::Success(value) => {
                trace!(
                    isolate,
                    context = context.get(),
                    execution,
                    elapsed_ms,
                    kind = value.type_name(),
                    "Execution completed"
                );
            }
            ExecutionResult::JavaScriptException(exception) => {
                debug!(
                    isolate,
                    context = context.get(),
                    execution,
                    elapsed_ms,
                    kind = ?exception.kind,
                    message = %exception.message,
                    "Execution raised"
                );
            }
            ExecutionResult::Terminated(reason) => {
                let message = format!("Execution terminated after {} ms: {}", elapsed_ms, reason);
                SandboxEvent::new(Level::WARN, SandboxDomain::Execution, reason.as_str(), &message)
                    .isolate(isolate)
                    .context(context.get())
                    .execution(execution)
                    .emit();
            }
            ExecutionResult::EngineFailure(reason) => {
                SandboxEvent::new(Level::ERROR, SandboxDomain::Execution, "engine_failure", reason)
                    .isolate(isolate)
                    .context(context.get())
                    .execution(execution)
                    .emit();
            }
        }
    }

    fn check_heap(&mut self) {
        if self.watch().heap_exhausted() {
            self.mark_unusable("heap limit reached".to_string());
        }
    }

    fn mark_unusable(&self, reason: String) {
        if self.shared.mark_unusable(reason.clone()) {
            let domain = if self.watch().heap_exhausted() {
                SandboxDomain::Memory
            } else {
                SandboxDomain::Isolate
            };
            let message = format!("Isolate is no longer usable: {}", reason);
            SandboxEvent::new(Level::ERROR, domain, "isolate_unusable", &message)
                .isolate(self.shared.id().get())
                .emit();
        }
    }

    fn sample_heap(&mut self) -> usize {
        let mut stats = v8::HeapStatistics::default();
        self.isolate.get_heap_statistics(&mut stats);
        let used = memory_footprint(&stats);
        self.watch().record_heap_used(used);
        used
    }

    fn heap_stats(&mut self) -> HeapStats {
        let mut stats = v8::HeapStatistics::default();
        self.isolate.get_heap_statistics(&mut stats);
        self.watch().record_heap_used(memory_footprint(&stats));
        HeapStats {
            total_heap_size: stats.total_heap_size(),
            used_heap_size: stats.used_heap_size(),
            total_physical_size: stats.total_physical_size(),
            total_available_size: stats.total_available_size(),
            heap_size_limit: stats.heap_size_limit(),
            malloced_memory: stats.malloced_memory(),
            external_memory: stats.external_memory(),
            native_contexts: stats.number_of_native_contexts(),
            detached_contexts: stats.number_of_detached_contexts(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Engine handles must be released while the isolate is still alive.
        if let Some(r) = registry_mut(&mut self.isolate) {
            r.clear();
        }
        info!(isolate = self.shared.id().get(), "Engine isolate disposed");
    }
}

/// Runs `work` in the scope's current context and copies the outcome out.
/// Top-level executions settle microtasks; nested ones leave that to the
/// outermost run.
pub(crate) fn evaluate(
    scope: &mut v8::HandleScope,
    context: ContextId,
    work: &Work,
    settle: bool,
) -> ExecutionResult {
    let tc = &mut v8::TryCatch::new(scope);
    let codec = Codec::for_scope(tc, context);
    let value = match work {
        Work::Eval { source } => {
            let Some(code) = v8::String::new(tc, source) else {
                return host_exception("RangeError", "source is too large");
            };
            match v8::Script::compile(tc, code, None) {
                Some(script) => script.run(tc),
                None => return failure(tc, ExceptionKind::Syntax),
            }
        }
        Work::Call { callee, args } => {
            let (function, receiver) = match resolve(tc, callee) {
                Ok(resolved) => resolved,
                Err(result) => return result,
            };
            let argv: Vec<v8::Local<v8::Value>> =
                args.iter().map(|arg| codec.to_engine(tc, arg)).collect();
            function.call(tc, receiver, &argv)
        }
    };
    let Some(value) = value else {
        return failure(tc, ExceptionKind::Runtime);
    };

    if settle {
        tc.perform_microtask_checkpoint();
        if tc.is_execution_terminating() {
            return terminated(tc);
        }
    }
    if let Ok(promise) = v8::Local::<v8::Promise>::try_from(value) {
        if promise.state() == v8::PromiseState::Rejected {
            promise.mark_as_handled();
            let reason = promise.result(tc);
            let exception = describe(tc, reason, None, ExceptionKind::Runtime);
            return ExecutionResult::JavaScriptException(exception);
        }
    }
    ExecutionResult::Success(codec.to_host(tc, value))
}

type Resolved<'s> = (v8::Local<'s, v8::Function>, v8::Local<'s, v8::Value>);

fn resolve<'s>(
    tc: &mut v8::TryCatch<v8::HandleScope<'s>>,
    callee: &Callee,
) -> std::result::Result<Resolved<'s>, ExecutionResult> {
    match callee {
        Callee::Function(function) => {
            let found = registry(tc)
                .filter(|r| r.isolate() == function.isolate())
                .and_then(|r| r.function(function.context(), function.id));
            match found {
                Some(global) => {
                    let local = v8::Local::new(tc, &global);
                    Ok((local, v8::undefined(tc).into()))
                }
                None => Err(host_exception(
                    "ReferenceError",
                    &format!("{} has been released or its context disposed", function),
                )),
            }
        }
        Callee::Global(path) => {
            let context = tc.get_current_context();
            let mut receiver: v8::Local<v8::Value> = context.global(tc).into();
            let mut current = receiver;
            for segment in path.split('.') {
                if current.is_null_or_undefined() {
                    return Err(host_exception("TypeError", &format!("{} is not a function", path)));
                }
                let object = current.to_object(tc);
                let key = v8::String::new(tc, segment);
                let (Some(object), Some(key)) = (object, key) else {
                    return Err(host_exception("TypeError", &format!("{} is not a function", path)));
                };
                receiver = current;
                current = match object.get(tc, key.into()) {
                    Some(value) => value,
                    None => return Err(failure(tc, ExceptionKind::Runtime)),
                };
            }
            match v8::Local::<v8::Function>::try_from(current) {
                Ok(function) => Ok((function, receiver)),
                Err(_) => Err(host_exception("TypeError", &format!("{} is not a function", path))),
            }
        }
    }
}

fn host_exception(name: &str, message: &str) -> ExecutionResult {
    ExecutionResult::JavaScriptException(ScriptException {
        kind: ExceptionKind::Runtime,
        message: format!("{}: {}", name, message),
        backtrace: None,
    })
}

fn failure(tc: &mut v8::TryCatch<v8::HandleScope>, kind: ExceptionKind) -> ExecutionResult {
    if tc.has_terminated() || tc.is_execution_terminating() {
        return terminated(tc);
    }
    match tc.exception() {
        Some(exception) => {
            let message = tc.message();
            ExecutionResult::JavaScriptException(describe(tc, exception, message, kind))
        }
        None => ExecutionResult::EngineFailure(
            "script produced neither a value nor an exception".into(),
        ),
    }
}

/// Best-effort reason for a termination seen from inside the engine; the
/// controller replaces it with the watchdog's verdict once disarmed.
fn terminated(isolate: &v8::Isolate) -> ExecutionResult {
    let reason = registry(isolate)
        .map(|r| {
            let watch = r.watch();
            let exhausted = watch.heap_exhausted().then_some(TerminationReason::MemoryLimit);
            watch.verdict().or(exhausted)
        })
        .unwrap_or(None)
        .unwrap_or(TerminationReason::Cancelled);
    ExecutionResult::Terminated(reason)
}

fn describe(
    scope: &mut v8::HandleScope,
    exception: v8::Local<v8::Value>,
    message: Option<v8::Local<v8::Message>>,
    kind: ExceptionKind,
) -> ScriptException {
    let text = exception
        .to_string(scope)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_else(|| "uncaught exception".to_string());
    let location = message.map(|m| {
        let line = m.get_line_number(scope).unwrap_or(0);
        format!("{}:{}", line, m.get_start_column() + 1)
    });
    let backtrace = match kind {
        ExceptionKind::Syntax => location,
        ExceptionKind::Runtime => stack_property(scope, exception).or(location),
    };
    ScriptException { kind, message: text, backtrace }
}

fn stack_property(scope: &mut v8::HandleScope, exception: v8::Local<v8::Value>) -> Option<String> {
    if !exception.is_object() {
        return None;
    }
    let object = exception.to_object(scope)?;
    let key = v8::String::new(scope, "stack")?;
    let stack = object.get(scope, key.into())?;
    if !stack.is_string() {
        return None;
    }
    let stack = stack.to_rust_string_lossy(scope);
    (!stack.is_empty()).then_some(stack)
}
