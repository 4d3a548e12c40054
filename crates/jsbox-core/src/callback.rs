use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, Level};

use crate::codec::Codec;
use crate::context::{Context, ContextId};
use crate::controller::evaluate;
use crate::error::{Error, Result};
use crate::events::{SandboxDomain, SandboxEvent};
use crate::execution::{Callee, ExecutionResult, Work};
use crate::isolate::IsolateId;
use crate::registry::{registry, BoundCallback};
use crate::value::HostValue;

/// A host function callable from script. It runs synchronously on the
/// isolate's engine thread.
pub type HostFunction = Arc<
    dyn Fn(
            &mut CallContext<'_, '_>,
            Vec<HostValue>,
        ) -> std::result::Result<HostValue, CallbackError>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackErrorKind {
    Error,
    TypeError,
    RangeError,
}

/// Failure returned by a host function; script code sees it as a thrown
/// exception of the matching type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackError {
    pub kind: CallbackErrorKind,
    pub message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { kind: CallbackErrorKind::Error, message: message.into() }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self { kind: CallbackErrorKind::TypeError, message: message.into() }
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self { kind: CallbackErrorKind::RangeError, message: message.into() }
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CallbackError {}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for CallbackError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<Error> for CallbackError {
    fn from(err: Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Handed to a host function while script is calling it. Lets the function
/// run more script on the current engine stack, under the budget of the
/// execution that is already running.
pub struct CallContext<'a, 's> {
    scope: &'a mut v8::HandleScope<'s>,
    isolate: IsolateId,
    context: ContextId,
    name: &'a str,
}

impl<'a, 's> CallContext<'a, 's> {
    /// The name the function was bound under.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn isolate_id(&self) -> IsolateId {
        self.isolate
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn eval(&mut self, source: &str) -> ExecutionResult {
        let scope = &mut v8::HandleScope::new(&mut *self.scope);
        evaluate(scope, self.context, &Work::Eval { source: source.to_string() }, false)
    }

    /// Evaluates `source` in another context of the same isolate.
    pub fn eval_in(&mut self, context: &Context, source: &str) -> Result<ExecutionResult> {
        if context.isolate_id() != self.isolate {
            return Err(Error::InvalidHandle(
                "context belongs to a different isolate; use its own handle".into(),
            ));
        }
        if context.is_disposed() {
            return Err(Error::Disposed);
        }
        let scope = &mut v8::HandleScope::new(&mut *self.scope);
        let Some(target) = registry(scope).and_then(|r| r.context(context.id())) else {
            return Err(Error::Disposed);
        };
        let target = v8::Local::new(scope, &target);
        let scope = &mut v8::ContextScope::new(scope, target);
        Ok(evaluate(scope, context.id(), &Work::Eval { source: source.to_string() }, false))
    }

    pub fn call(&mut self, callee: impl Into<Callee>, args: Vec<HostValue>) -> ExecutionResult {
        let scope = &mut v8::HandleScope::new(&mut *self.scope);
        evaluate(scope, self.context, &Work::Call { callee: callee.into(), args }, false)
    }
}

/// Splits a binding name such as `host.math.add` into its segments.
pub(crate) fn binding_path(name: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = name.split('.').collect();
    if segments.iter().any(|s| s.trim().is_empty() || s.trim() != *s) {
        return Err(Error::InvalidArgument(format!("invalid binding name '{}'", name)));
    }
    Ok(segments)
}

/// Defines the engine function for callback `id` at `name` on the current
/// context's global object, creating intermediate objects as needed.
pub(crate) fn install(scope: &mut v8::HandleScope, name: &str, id: u32) -> Result<()> {
    let segments = binding_path(name)?;
    let tc = &mut v8::TryCatch::new(scope);
    let context = tc.get_current_context();
    let mut target = context.global(tc);
    let (last, parents) = segments.split_last().ok_or_else(|| {
        Error::InvalidArgument(format!("invalid binding name '{}'", name))
    })?;
    for segment in parents {
        let key = engine_string(tc, segment)?;
        let existing = target.get(tc, key.into());
        target = match existing {
            Some(value) if value.is_object() => value
                .to_object(tc)
                .ok_or_else(|| Error::InvalidArgument(format!("'{}' is not an object", segment)))?,
            Some(value) if !value.is_null_or_undefined() => {
                return Err(Error::InvalidArgument(format!(
                    "cannot bind '{}': '{}' is not an object",
                    name, segment
                )));
            }
            _ => {
                let object = v8::Object::new(tc);
                define(tc, target, key, object.into(), name)?;
                object
            }
        };
    }

    let data = v8::Integer::new_from_unsigned(tc, id);
    let function = v8::Function::builder(dispatch)
        .data(data.into())
        .build(tc)
        .ok_or_else(|| Error::InvalidArgument(format!("cannot create function for '{}'", name)))?;
    let key = engine_string(tc, last)?;
    function.set_name(key);
    define(tc, target, key, function.into(), name)
}

/// Deletes the property at `name`; intermediate objects are left in place.
pub(crate) fn uninstall(scope: &mut v8::HandleScope, name: &str) -> Result<()> {
    let segments = binding_path(name)?;
    let tc = &mut v8::TryCatch::new(scope);
    let context = tc.get_current_context();
    let mut target = context.global(tc);
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };
    for segment in parents {
        let key = engine_string(tc, segment)?;
        match target.get(tc, key.into()).and_then(|v| v.to_object(tc)) {
            Some(object) => target = object,
            None => return Ok(()),
        }
    }
    let key = engine_string(tc, last)?;
    target.delete(tc, key.into());
    Ok(())
}

fn engine_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    text: &str,
) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, text)
        .ok_or_else(|| Error::InvalidArgument(format!("binding name '{}' is too long", text)))
}

fn define(
    scope: &mut v8::HandleScope,
    target: v8::Local<v8::Object>,
    key: v8::Local<v8::String>,
    value: v8::Local<v8::Value>,
    name: &str,
) -> Result<()> {
    match target.create_data_property(scope, key.into(), value) {
        Some(true) => Ok(()),
        _ => Err(Error::InvalidArgument(format!("cannot define binding '{}'", name))),
    }
}

/// Entry point of every bound function. Panics must not cross into the
/// engine, so the body runs under `catch_unwind`.
fn dispatch<'a>(
    scope: &mut v8::HandleScope<'a>,
    args: v8::FunctionCallbackArguments<'a>,
    rv: v8::ReturnValue,
) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| invoke(scope, &args, rv))) {
        error!(reason = %panic_message(payload.as_ref()), "Callback dispatch panicked");
    }
}

fn invoke<'a>(
    scope: &mut v8::HandleScope<'a>,
    args: &v8::FunctionCallbackArguments<'a>,
    mut rv: v8::ReturnValue,
) {
    let Ok(id) = v8::Local::<v8::Integer>::try_from(args.data()) else {
        throw(scope, &CallbackError::new("host function is missing its binding"));
        return;
    };
    let id = id.value() as u32;
    let Some(bound) = registry(scope).and_then(|r| r.callback(id)) else {
        throw(scope, &CallbackError::new("host function is no longer bound"));
        return;
    };
    let BoundCallback { context, name, function } = bound;
    let isolate = match registry(scope) {
        Some(r) => r.isolate(),
        None => return,
    };

    let codec = Codec::for_scope(scope, context);
    let mut host_args = Vec::with_capacity(args.length().max(0) as usize);
    for index in 0..args.length() {
        host_args.push(codec.to_host(scope, args.get(index)));
    }

    let outcome = {
        let mut call = CallContext { scope: &mut *scope, isolate, context, name: &name };
        panic::catch_unwind(AssertUnwindSafe(|| function(&mut call, host_args)))
    };

    // A termination requested during the call must keep unwinding.
    if scope.is_execution_terminating() {
        return;
    }

    match outcome {
        Ok(Ok(value)) => {
            let value = codec.to_engine(scope, &value);
            rv.set(value);
        }
        Ok(Err(err)) => {
            debug!(
                isolate = isolate.get(),
                context = context.get(),
                callback = %name,
                error = %err,
                "Host function failed"
            );
            throw(scope, &err);
        }
        Err(payload) => {
            let message =
                format!("host function '{}' panicked: {}", name, panic_message(payload.as_ref()));
            SandboxEvent::new(Level::WARN, SandboxDomain::Callback, "callback_panic", &message)
                .isolate(isolate.get())
                .context(context.get())
                .emit();
            throw(scope, &CallbackError::new(message));
        }
    }
}

fn throw(scope: &mut v8::HandleScope, err: &CallbackError) {
    let message = v8::String::new(scope, &err.message).unwrap_or_else(|| v8::String::empty(scope));
    let exception = match err.kind {
        CallbackErrorKind::Error => v8::Exception::error(scope, message),
        CallbackErrorKind::TypeError => v8::Exception::type_error(scope, message),
        CallbackErrorKind::RangeError => v8::Exception::range_error(scope, message),
    };
    scope.throw_exception(exception);
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_paths_split_on_dots() {
        assert_eq!(binding_path("add").ok(), Some(vec!["add"]));
        assert_eq!(binding_path("host.math.add").ok(), Some(vec!["host", "math", "add"]));
    }

    #[test]
    fn malformed_binding_paths_are_rejected() {
        for name in ["", ".", "a..b", "a.", " a", "a. b"] {
            assert!(matches!(binding_path(name), Err(Error::InvalidArgument(_))), "{name:?}");
        }
    }

    #[test]
    fn callback_errors_convert_from_common_sources() {
        let err: CallbackError = "boom".into();
        assert_eq!(err.kind, CallbackErrorKind::Error);
        let err: CallbackError = anyhow::anyhow!("inner").context("outer").into();
        assert_eq!(err.message, "outer: inner");
        assert_eq!(CallbackError::type_error("t").kind, CallbackErrorKind::TypeError);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload = panic::catch_unwind(|| panic!("bad {}", 1)).err();
        let message = payload.as_deref().map(panic_message).unwrap_or_default();
        assert_eq!(message, "bad 1");
    }
}
