//! Sandboxed JavaScript execution on embedded V8 isolates.
//!
//! Each [`Isolate`] runs on its own engine thread with a fixed heap ceiling
//! and a watchdog that enforces per-execution timeouts and memory budgets.
//! Scripts run inside a [`Context`]; values cross the boundary as copies
//! ([`HostValue`]), and host functions can be bound into a context as
//! globals.

mod callback;
mod codec;
pub mod config;
mod context;
mod controller;
mod error;
pub mod events;
mod execution;
mod isolate;
pub mod platform;
mod registry;
mod snapshot;
mod timeout;
mod value;
mod watchdog;

pub use callback::{CallContext, CallbackError, CallbackErrorKind, HostFunction};
pub use config::{Config, IsolateConfig};
pub use context::{Context, ContextId, ContextInfo};
pub use error::{Error, Result};
pub use execution::{
    Callee, ExceptionKind, ExecutionRequest, ExecutionResult, ExecutionState, PendingExecution,
    ScriptException, TerminationReason, Work,
};
pub use isolate::{DisposePolicy, HeapStats, Isolate, IsolateId, IsolateStatus};
pub use snapshot::Snapshot;
pub use value::{FunctionRef, HostValue, Placeholder, MAX_SAFE_INTEGER};
