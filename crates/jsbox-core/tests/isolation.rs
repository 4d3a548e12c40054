use std::thread;
use std::time::{Duration, Instant};

use jsbox_core::{
    Context, DisposePolicy, Error, ExecutionRequest, ExecutionState, HostValue, Isolate,
    IsolateConfig, IsolateStatus,
};

fn isolate() -> Isolate {
    Isolate::new(IsolateConfig::default()).expect("isolate")
}

fn value(context: &Context, source: &str) -> HostValue {
    context
        .eval(source)
        .expect("eval")
        .into_value()
        .unwrap_or_else(|| panic!("expected success for {source:?}"))
}

#[test]
fn isolates_do_not_share_globals() {
    let first = isolate();
    let second = isolate();
    assert_ne!(first.id(), second.id());

    let a = first.create_context().expect("context");
    let b = second.create_context().expect("context");
    a.eval("globalThis.shared = 'a'; Array.prototype.tainted = true").expect("eval");
    assert_eq!(value(&b, "typeof shared"), HostValue::from("undefined"));
    assert_eq!(value(&b, "[].tainted"), HostValue::Undefined);
}

#[test]
fn contexts_in_one_isolate_are_separate() {
    let isolate = isolate();
    let a = isolate.create_context().expect("context");
    let b = isolate.create_context().expect("context");
    assert_ne!(a.id(), b.id());
    assert_eq!(a.isolate_id(), b.isolate_id());

    a.eval("var x = 1; Object.prototype.marker = 'a'").expect("eval");
    b.eval("var x = 2").expect("eval");
    assert_eq!(value(&a, "x"), HostValue::Integer(1));
    assert_eq!(value(&b, "x"), HostValue::Integer(2));
    assert_eq!(value(&b, "({}).marker"), HostValue::Undefined);
}

#[test]
fn disposing_a_context_leaves_siblings_running() {
    let isolate = isolate();
    let doomed = isolate.create_context().expect("context");
    let survivor = isolate.create_context().expect("context");
    doomed.bind("noop", |_, _| Ok(HostValue::Null)).expect("bind");

    doomed.dispose();
    doomed.dispose();
    assert!(doomed.is_disposed());
    assert_eq!(doomed.eval("1").expect_err("disposed"), Error::Disposed);
    assert_eq!(doomed.info().expect_err("disposed"), Error::Disposed);
    assert!(matches!(doomed.bind("again", |_, _| Ok(HostValue::Null)), Err(Error::Disposed)));
    assert_eq!(value(&survivor, "1 + 1"), HostValue::Integer(2));
}

#[test]
fn dropping_the_last_context_handle_frees_it() {
    let isolate = isolate();
    let context = isolate.create_context().expect("context");
    let clone = context.clone();
    drop(context);
    assert_eq!(value(&clone, "'still here'"), HostValue::from("still here"));
    drop(clone);
    assert!(isolate.heap_stats().expect("stats").native_contexts >= 1);
}

#[test]
fn isolate_dispose_is_idempotent_and_final() {
    let isolate = isolate();
    let context = isolate.create_context().expect("context");
    assert_eq!(isolate.status(), IsolateStatus::Ready);

    isolate.dispose(DisposePolicy::Wait).expect("dispose");
    isolate.dispose(DisposePolicy::Wait).expect("dispose again");
    isolate.dispose(DisposePolicy::FailIfBusy).expect("dispose again");
    assert_eq!(isolate.status(), IsolateStatus::Disposed);
    assert!(!isolate.is_usable());

    assert_eq!(context.eval("1").expect_err("disposed"), Error::Disposed);
    assert_eq!(isolate.create_context().expect_err("disposed"), Error::Disposed);
    assert_eq!(isolate.heap_stats().expect_err("disposed"), Error::Disposed);
    context.dispose();
}

#[test]
fn dispose_waits_for_accepted_work() {
    let isolate = isolate();
    let context = isolate.create_context().expect("context");
    let pending = context
        .submit(ExecutionRequest::eval("let s = 0; for (let i = 0; i < 1e5; i++) s += i; s"))
        .expect("submit");
    isolate.dispose(DisposePolicy::Wait).expect("dispose");
    assert_eq!(pending.state(), ExecutionState::Completed);
    assert_eq!(pending.wait().into_value(), Some(HostValue::Integer(4_999_950_000)));
}

#[test]
fn fail_if_busy_refuses_while_work_is_in_flight() {
    let isolate = isolate();
    let context = isolate.create_context().expect("context");
    let pending = context
        .submit(ExecutionRequest::eval("while (true) {}").with_timeout(Duration::from_millis(200)))
        .expect("submit");
    let started = Instant::now();
    while pending.state() != ExecutionState::Running {
        assert!(started.elapsed() < Duration::from_secs(5), "execution never started");
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(isolate.in_flight(), 1);
    assert_eq!(isolate.dispose(DisposePolicy::FailIfBusy), Err(Error::Busy { active: 1 }));
    assert!(isolate.is_usable());

    assert_eq!(pending.wait().termination(), Some(jsbox_core::TerminationReason::Timeout));
    assert_eq!(isolate.in_flight(), 0);
    isolate.dispose(DisposePolicy::FailIfBusy).expect("dispose");
}

#[test]
fn invalid_configuration_is_rejected_up_front() {
    let cases = [
        IsolateConfig { max_heap_mb: 0, ..IsolateConfig::default() },
        IsolateConfig { initial_heap_mb: 256, max_heap_mb: 128, ..IsolateConfig::default() },
        IsolateConfig { memory_sample_interval: Duration::ZERO, ..IsolateConfig::default() },
        IsolateConfig { marshal_max_depth: 0, ..IsolateConfig::default() },
        IsolateConfig { default_max_memory_delta: Some(0), ..IsolateConfig::default() },
    ];
    for config in cases {
        let err = Isolate::new(config.clone()).expect_err("invalid config");
        assert!(matches!(err, Error::EngineInit(_)), "{config:?}: {err:?}");
    }
}

#[test]
fn isolates_run_in_parallel() {
    let workers: Vec<_> = (0..4)
        .map(|n| {
            thread::spawn(move || {
                let isolate = isolate();
                let context = isolate.create_context().expect("context");
                context.eval(&format!("var id = {n}")).expect("eval");
                let result = context
                    .eval("let acc = 0; for (let i = 0; i < 2e5; i++) acc = (acc + i) % 1000; id")
                    .expect("eval");
                isolate.dispose(DisposePolicy::Wait).expect("dispose");
                result.into_value()
            })
        })
        .collect();
    for (n, worker) in workers.into_iter().enumerate() {
        assert_eq!(worker.join().expect("worker"), Some(HostValue::Integer(n as i64)));
    }
}

#[test]
fn a_timeout_in_one_isolate_does_not_touch_another() {
    let slow = isolate();
    let fast = isolate();
    let slow_context = slow.create_context().expect("context");
    let fast_context = fast.create_context().expect("context");
    let spinning = slow_context
        .submit(ExecutionRequest::eval("while (true) {}").with_timeout(Duration::from_millis(150)))
        .expect("submit");
    for n in 0..10 {
        assert_eq!(value(&fast_context, &format!("{n} * 2")), HostValue::Integer(n * 2));
    }
    assert!(spinning.wait().termination().is_some());
    assert!(slow.is_usable());
}

#[test]
fn info_describes_bindings_and_functions() {
    let isolate = isolate();
    let context = isolate.create_context().expect("context");
    context.bind("log", |_, _| Ok(HostValue::Undefined)).expect("bind");
    context.bind("host.fs.read", |_, _| Ok(HostValue::Undefined)).expect("bind");
    context.eval("globalThis.keep = () => 1; keep").expect("eval");

    let info = context.info().expect("info");
    assert_eq!(info.id, context.id());
    assert_eq!(info.isolate, isolate.id());
    let mut bindings = info.bindings.clone();
    bindings.sort();
    assert_eq!(bindings, vec!["host.fs.read".to_string(), "log".to_string()]);
    assert_eq!(info.live_functions, 1);
    assert!(info.created_at_ms > 0);
}

#[test]
fn platform_stays_up_while_isolates_live() {
    let isolate = isolate();
    assert!(jsbox_core::platform::is_initialized());
    assert!(jsbox_core::platform::live_isolates() >= 1);
    jsbox_core::platform::initialize().expect("initialize is idempotent");
    assert!(matches!(jsbox_core::platform::shutdown(), Err(Error::Platform(_))));
    assert!(matches!(jsbox_core::platform::set_flags("--no-opt"), Err(Error::Platform(_))));
    assert!(isolate.is_usable());
}
