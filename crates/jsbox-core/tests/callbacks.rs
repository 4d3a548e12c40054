use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use jsbox_core::{
    CallbackError, Context, DisposePolicy, Error, ExecutionRequest, ExecutionResult, HostValue,
    Isolate, IsolateConfig,
};

fn context() -> (Isolate, Context) {
    let isolate = Isolate::new(IsolateConfig::default()).expect("isolate");
    let context = isolate.create_context().expect("context");
    (isolate, context)
}

fn sum(args: &[HostValue]) -> Result<HostValue, CallbackError> {
    let mut total = 0i64;
    for arg in args {
        let Some(n) = arg.as_i64() else {
            let message = format!("expected an integer, got {}", arg.type_name());
            return Err(CallbackError::type_error(message));
        };
        total += n;
    }
    Ok(HostValue::Integer(total))
}

#[test]
fn bound_function_is_callable_from_script() {
    let (_isolate, context) = context();
    context.bind("add", |_, args| sum(&args)).expect("bind");
    let result = context.eval("add(2, 3)").expect("eval");
    assert_eq!(result, ExecutionResult::Success(HostValue::Integer(5)));
}

#[test]
fn callback_errors_are_catchable_script_exceptions() {
    let (_isolate, context) = context();
    context.bind("add", |_, args| sum(&args)).expect("bind");
    let result = context
        .eval("try { add('a', 1); 'no error' } catch (e) { `${e.name}: ${e.message}` }")
        .expect("eval");
    assert_eq!(
        result.value(),
        Some(&HostValue::from("TypeError: expected an integer, got string"))
    );

    let result = context.eval("add(1, null)").expect("eval");
    let exception = result.exception().expect("exception");
    assert!(exception.message.starts_with("TypeError"), "{}", exception.message);
}

#[test]
fn range_errors_keep_their_class() {
    let (_isolate, context) = context();
    context
        .bind("checked", |_, _| Err(CallbackError::range_error("out of range")))
        .expect("bind");
    let result = context
        .eval("try { checked() } catch (e) { e instanceof RangeError }")
        .expect("eval");
    assert_eq!(result.value(), Some(&HostValue::Bool(true)));
}

#[test]
fn panicking_callback_becomes_exception_and_isolate_survives() {
    let (isolate, context) = context();
    context
        .bind("explode", |_, _| -> Result<HostValue, CallbackError> { panic!("kaboom") })
        .expect("bind");
    let result = context.eval("explode()").expect("eval");
    let exception = result.exception().expect("exception");
    assert!(exception.message.contains("kaboom"), "{}", exception.message);
    assert!(isolate.is_usable());
    assert!(context.eval("1 + 1").expect("eval").is_success());
}

#[test]
fn dotted_names_create_namespace_objects() {
    let (_isolate, context) = context();
    context.bind("host.math.add", |_, args| sum(&args)).expect("bind");
    context
        .bind("host.math.neg", |_, args| {
            Ok(HostValue::Integer(-args.first().and_then(HostValue::as_i64).unwrap_or(0)))
        })
        .expect("bind");
    let result = context
        .eval("[typeof host, typeof host.math, host.math.add(1, 2, 3), host.math.neg(4)]")
        .expect("eval");
    assert_eq!(
        result.into_value(),
        Some(HostValue::from(vec![
            HostValue::from("object"),
            HostValue::from("object"),
            HostValue::Integer(6),
            HostValue::Integer(-4),
        ]))
    );
}

#[test]
fn malformed_binding_names_are_rejected() {
    let (_isolate, context) = context();
    for name in ["", "a..b", "trailing."] {
        let err = context.bind(name, |_, _| Ok(HostValue::Null)).expect_err("bind");
        assert!(matches!(err, Error::InvalidArgument(_)), "{name:?}: {err:?}");
    }
}

#[test]
fn rebinding_replaces_and_unbinding_removes() {
    let (_isolate, context) = context();
    context.bind("version", |_, _| Ok(HostValue::from(1))).expect("bind");
    assert_eq!(context.eval("version()").expect("eval").into_value(), Some(HostValue::Integer(1)));

    context.bind("version", |_, _| Ok(HostValue::from(2))).expect("rebind");
    assert_eq!(context.eval("version()").expect("eval").into_value(), Some(HostValue::Integer(2)));

    assert!(context.unbind("version").expect("unbind"));
    assert!(!context.unbind("version").expect("unbind again"));
    let result = context.eval("typeof version").expect("eval");
    assert_eq!(result.value(), Some(&HostValue::from("undefined")));
    let result = context.eval("version()").expect("eval");
    assert!(result.exception().expect("exception").message.starts_with("ReferenceError"));
}

#[test]
fn arguments_are_marshalled_to_host_values() {
    let (_isolate, context) = context();
    let seen: Arc<Mutex<Vec<HostValue>>> = Arc::default();
    let sink = Arc::clone(&seen);
    context
        .bind("record", move |_, args| {
            sink.lock().expect("lock").extend(args);
            Ok(HostValue::Undefined)
        })
        .expect("bind");
    let result = context
        .eval("record(1, 2.5, 'str', true, null, undefined, [1, 'a'], { k: 'v' })")
        .expect("eval");
    assert_eq!(result.value(), Some(&HostValue::Undefined));

    let seen = seen.lock().expect("lock");
    assert_eq!(
        *seen,
        vec![
            HostValue::Integer(1),
            HostValue::Float(2.5),
            HostValue::from("str"),
            HostValue::Bool(true),
            HostValue::Null,
            HostValue::Undefined,
            HostValue::from(vec![HostValue::Integer(1), HostValue::from("a")]),
            HostValue::object([("k", HostValue::from("v"))]),
        ]
    );
}

#[test]
fn return_values_are_copied_into_the_engine() {
    let (_isolate, context) = context();
    context
        .bind("config", |_, _| {
            Ok(HostValue::object([
                ("name", HostValue::from("svc")),
                ("ports", HostValue::from(vec![HostValue::from(80), HostValue::from(443)])),
            ]))
        })
        .expect("bind");
    let result = context
        .eval("const c = config(); c.ports.push(8080); `${c.name}:${c.ports.join(',')}`")
        .expect("eval");
    assert_eq!(result.value(), Some(&HostValue::from("svc:80,443,8080")));
    let result = context.eval("config().ports.length").expect("eval");
    assert_eq!(result.value(), Some(&HostValue::Integer(2)));
}

#[test]
fn call_context_exposes_binding_identity() {
    let (isolate, context) = context();
    let expected = (isolate.id(), context.id());
    context
        .bind("tools.whoami", move |call, _| {
            assert_eq!((call.isolate_id(), call.context_id()), expected);
            Ok(HostValue::from(call.name()))
        })
        .expect("bind");
    let result = context.eval("tools.whoami()").expect("eval");
    assert_eq!(result.value(), Some(&HostValue::from("tools.whoami")));
}

#[test]
fn nested_eval_runs_in_the_calling_context() {
    let (_isolate, context) = context();
    context.eval("var depth = 0").expect("eval");
    context
        .bind("nested", |call, args| {
            let source =
                args.first().and_then(HostValue::as_str).unwrap_or("undefined").to_string();
            match call.eval(&source) {
                ExecutionResult::Success(value) => Ok(value),
                ExecutionResult::JavaScriptException(e) => Err(CallbackError::new(e.message)),
                other => Err(CallbackError::new(format!("nested eval did not finish: {other:?}"))),
            }
        })
        .expect("bind");
    let result = context.eval("depth = 1; nested('depth + 41')").expect("eval");
    assert_eq!(result.value(), Some(&HostValue::Integer(42)));

    let result = context
        .eval("try { nested('throw new Error(\"inner\")') } catch (e) { e.message }")
        .expect("eval");
    assert!(result.value().and_then(HostValue::as_str).is_some_and(|m| m.contains("inner")));
}

#[test]
fn nested_call_invokes_script_functions() {
    let (_isolate, context) = context();
    context.eval("function square(x) { return x * x }").expect("eval");
    context
        .bind("viaHost", |call, args| match call.call("square", args) {
            ExecutionResult::Success(value) => Ok(value),
            other => Err(CallbackError::new(format!("{other:?}"))),
        })
        .expect("bind");
    let result = context.eval("viaHost(12)").expect("eval");
    assert_eq!(result.value(), Some(&HostValue::Integer(144)));
}

#[test]
fn eval_in_reaches_sibling_contexts_of_the_same_isolate() {
    let (isolate, context) = context();
    let sibling = isolate.create_context().expect("sibling");
    sibling.eval("var secret = 'from sibling'").expect("eval");

    let target = sibling.clone();
    context
        .bind("peek", move |call, _| {
            let result = call.eval_in(&target, "secret")?;
            result.into_value().ok_or_else(|| CallbackError::new("sibling eval failed"))
        })
        .expect("bind");
    let result = context.eval("peek()").expect("eval");
    assert_eq!(result.value(), Some(&HostValue::from("from sibling")));
    assert_eq!(
        context.eval("typeof secret").expect("eval").into_value(),
        Some(HostValue::from("undefined"))
    );

    let foreign_isolate = Isolate::new(IsolateConfig::default()).expect("isolate");
    let foreign = foreign_isolate.create_context().expect("context");
    context
        .bind("peekForeign", move |call, _| {
            let err = call.eval_in(&foreign, "1").expect_err("foreign context");
            assert!(matches!(err, Error::InvalidHandle(_)), "{err:?}");
            Ok(HostValue::Bool(true))
        })
        .expect("bind");
    assert!(context.eval("peekForeign()").expect("eval").is_success());
    isolate.dispose(DisposePolicy::Wait).expect("dispose");
}

#[test]
fn blocking_context_calls_from_a_callback_report_deadlock() {
    let (isolate, context) = context();
    let handle = context.clone();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    context
        .bind("reenter", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            match handle.eval("1") {
                Err(Error::WouldDeadlock) => Ok(HostValue::from("deadlock avoided")),
                other => Err(CallbackError::new(format!("unexpected: {other:?}"))),
            }
        })
        .expect("bind");
    let result = context.eval("reenter()").expect("eval");
    assert_eq!(result.value(), Some(&HostValue::from("deadlock avoided")));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    // The callback holds a handle to its own context.
    isolate.dispose(DisposePolicy::Wait).expect("dispose");
}

#[test]
fn waiting_on_a_submission_from_a_callback_does_not_hang() {
    let (isolate, context) = context();
    let handle = context.clone();
    context
        .bind("enqueue", move |_, _| {
            let pending = handle
                .submit(ExecutionRequest::eval("globalThis.later = 7"))
                .map_err(|err| CallbackError::new(err.to_string()))?;
            match pending.wait() {
                ExecutionResult::EngineFailure(message) if message.contains("engine thread") => {
                    Ok(HostValue::from("refused"))
                }
                other => Err(CallbackError::new(format!("unexpected: {other:?}"))),
            }
        })
        .expect("bind");
    let result = context.eval("enqueue()").expect("eval");
    assert_eq!(result.value(), Some(&HostValue::from("refused")));
    // The submission stays queued and runs after the calling script.
    assert_eq!(context.eval("later").expect("eval").into_value(), Some(HostValue::Integer(7)));
    isolate.dispose(DisposePolicy::Wait).expect("dispose");
}

#[test]
fn callbacks_see_functions_passed_from_script() {
    let (_isolate, context) = context();
    context
        .bind("apply", |call, mut args| {
            let Some(HostValue::Function(function)) = args.first().cloned() else {
                return Err(CallbackError::type_error("first argument must be a function"));
            };
            args.remove(0);
            match call.call(function, args) {
                ExecutionResult::Success(value) => Ok(value),
                other => Err(CallbackError::new(format!("{other:?}"))),
            }
        })
        .expect("bind");
    let result = context.eval("apply((a, b) => a * b, 6, 7)").expect("eval");
    assert_eq!(result.value(), Some(&HostValue::Integer(42)));
}
