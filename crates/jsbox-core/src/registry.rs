use std::collections::HashMap;
use std::sync::Arc;

use crate::callback::HostFunction;
use crate::context::ContextId;
use crate::isolate::IsolateId;
use crate::watchdog::WatchShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MarshalLimits {
    pub max_depth: usize,
    pub max_values: usize,
    /// Largest byte buffer copied out of the engine.
    pub max_bytes: usize,
}

pub(crate) struct ContextEntry {
    context: v8::Global<v8::Context>,
    bindings: HashMap<String, u32>,
    functions: HashMap<u64, v8::Global<v8::Function>>,
}

#[derive(Clone)]
pub(crate) struct BoundCallback {
    pub context: ContextId,
    pub name: String,
    pub function: HostFunction,
}

/// Engine-side state of one isolate, stored in the isolate's slot so that
/// native callbacks can reach it from a bare scope. Only the engine thread
/// ever touches it.
pub(crate) struct Registry {
    isolate: IsolateId,
    limits: MarshalLimits,
    watch: Arc<WatchShared>,
    contexts: HashMap<ContextId, ContextEntry>,
    callbacks: HashMap<u32, BoundCallback>,
    next_callback: u32,
    next_function: u64,
}

impl Registry {
    pub fn new(isolate: IsolateId, limits: MarshalLimits, watch: Arc<WatchShared>) -> Self {
        Self {
            isolate,
            limits,
            watch,
            contexts: HashMap::new(),
            callbacks: HashMap::new(),
            next_callback: 1,
            next_function: 1,
        }
    }

    pub fn isolate(&self) -> IsolateId {
        self.isolate
    }

    pub fn limits(&self) -> MarshalLimits {
        self.limits
    }

    pub fn watch(&self) -> &Arc<WatchShared> {
        &self.watch
    }

    pub fn insert_context(&mut self, id: ContextId, context: v8::Global<v8::Context>) {
        self.contexts.insert(
            id,
            ContextEntry {
                context,
                bindings: HashMap::new(),
                functions: HashMap::new(),
            },
        );
    }

    /// Drops the context together with its bindings and function arena.
    pub fn remove_context(&mut self, id: ContextId) -> bool {
        let Some(entry) = self.contexts.remove(&id) else {
            return false;
        };
        for callback in entry.bindings.values() {
            self.callbacks.remove(callback);
        }
        true
    }

    pub fn context(&self, id: ContextId) -> Option<v8::Global<v8::Context>> {
        self.contexts.get(&id).map(|entry| entry.context.clone())
    }

    /// Registers `function` under `name`, retiring whatever was bound there
    /// before. Returns the callback id to store in the engine function.
    pub fn register_callback(
        &mut self,
        context: ContextId,
        name: &str,
        function: HostFunction,
    ) -> Option<u32> {
        let entry = self.contexts.get_mut(&context)?;
        let id = self.next_callback;
        self.next_callback = self.next_callback.wrapping_add(1).max(1);
        if let Some(previous) = entry.bindings.insert(name.to_string(), id) {
            self.callbacks.remove(&previous);
        }
        self.callbacks.insert(id, BoundCallback { context, name: name.to_string(), function });
        Some(id)
    }

    pub fn unregister_callback(&mut self, context: ContextId, name: &str) -> Option<u32> {
        let entry = self.contexts.get_mut(&context)?;
        let id = entry.bindings.remove(name)?;
        self.callbacks.remove(&id);
        Some(id)
    }

    pub fn callback(&self, id: u32) -> Option<BoundCallback> {
        self.callbacks.get(&id).cloned()
    }

    pub fn binding_names(&self, context: ContextId) -> Vec<String> {
        let mut names: Vec<String> = self
            .contexts
            .get(&context)
            .map(|entry| entry.bindings.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn store_function(
        &mut self,
        context: ContextId,
        function: v8::Global<v8::Function>,
    ) -> Option<u64> {
        let entry = self.contexts.get_mut(&context)?;
        let id = self.next_function;
        self.next_function += 1;
        entry.functions.insert(id, function);
        Some(id)
    }

    pub fn function(&self, context: ContextId, id: u64) -> Option<v8::Global<v8::Function>> {
        self.contexts.get(&context)?.functions.get(&id).cloned()
    }

    pub fn release_function(&mut self, context: ContextId, id: u64) -> bool {
        self.contexts
            .get_mut(&context)
            .map(|entry| entry.functions.remove(&id).is_some())
            .unwrap_or(false)
    }

    pub fn function_count(&self, context: ContextId) -> usize {
        self.contexts.get(&context).map(|entry| entry.functions.len()).unwrap_or(0)
    }

    /// Drops every engine handle. Must run while the isolate is still alive.
    pub fn clear(&mut self) {
        self.callbacks.clear();
        self.contexts.clear();
    }
}

pub(crate) fn registry(isolate: &v8::Isolate) -> Option<&Registry> {
    isolate.get_slot::<Registry>()
}

pub(crate) fn registry_mut(isolate: &mut v8::Isolate) -> Option<&mut Registry> {
    isolate.get_slot_mut::<Registry>()
}
