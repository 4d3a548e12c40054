use indexmap::IndexMap;

use crate::context::ContextId;
use crate::isolate::IsolateId;
use crate::registry::{registry, registry_mut, MarshalLimits};
use crate::value::{FunctionRef, HostValue, Placeholder, MAX_SAFE_INTEGER};

/// Copies values across the engine boundary for one context. Both directions
/// are total: whatever cannot be represented turns into a placeholder or
/// `undefined`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Codec {
    isolate: IsolateId,
    context: ContextId,
    limits: MarshalLimits,
}

impl Codec {
    pub fn for_scope(scope: &v8::Isolate, context: ContextId) -> Self {
        let (isolate, limits) = match registry(scope) {
            Some(r) => (r.isolate(), r.limits()),
            None => {
                let limits = MarshalLimits { max_depth: 1, max_values: 1, max_bytes: 0 };
                (IsolateId::detached(), limits)
            }
        };
        Self { isolate, context, limits }
    }

    pub fn to_host<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> HostValue {
        let mut walk = ToHost { codec: self, path: Vec::new(), visited: 0 };
        walk.value(scope, value, 0)
    }

    pub fn to_engine<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        value: &HostValue,
    ) -> v8::Local<'s, v8::Value> {
        self.engine_value(scope, value, 0)
    }

    fn engine_value<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        value: &HostValue,
        depth: usize,
    ) -> v8::Local<'s, v8::Value> {
        match value {
            HostValue::Undefined => v8::undefined(scope).into(),
            HostValue::Null => v8::null(scope).into(),
            HostValue::Bool(b) => v8::Boolean::new(scope, *b).into(),
            HostValue::Integer(i) if i.unsigned_abs() <= MAX_SAFE_INTEGER as u64 => {
                v8::Number::new(scope, *i as f64).into()
            }
            HostValue::Integer(i) => v8::BigInt::new_from_i64(scope, *i).into(),
            HostValue::Float(f) => v8::Number::new(scope, *f).into(),
            HostValue::String(s) => string(scope, s),
            HostValue::Date(ms) => match v8::Date::new(scope, *ms) {
                Some(date) => date.into(),
                None => v8::undefined(scope).into(),
            },
            HostValue::Binary(bytes) => binary(scope, bytes),
            HostValue::Function(function) => self.function(scope, function),
            HostValue::Placeholder(placeholder) => string(scope, &placeholder.to_string()),
            HostValue::Array(_) | HostValue::Object(_) if depth >= self.limits.max_depth => {
                string(scope, &Placeholder::DepthLimit.to_string())
            }
            HostValue::Array(items) => {
                let elements: Vec<v8::Local<v8::Value>> =
                    items.iter().map(|item| self.engine_value(scope, item, depth + 1)).collect();
                v8::Array::new_with_elements(scope, &elements).into()
            }
            HostValue::Object(entries) => {
                let object = v8::Object::new(scope);
                for (key, entry) in entries {
                    let Some(key) = v8::String::new(scope, key) else {
                        continue;
                    };
                    let entry = self.engine_value(scope, entry, depth + 1);
                    // Data properties only: `__proto__` stays an ordinary key.
                    let _ = object.create_data_property(scope, key.into(), entry);
                }
                object.into()
            }
        }
    }

    fn function<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        function: &FunctionRef,
    ) -> v8::Local<'s, v8::Value> {
        if function.isolate != self.isolate {
            return v8::undefined(scope).into();
        }
        match registry(scope).and_then(|r| r.function(function.context, function.id)) {
            Some(global) => v8::Local::new(scope, &global).into(),
            None => v8::undefined(scope).into(),
        }
    }

    fn store_function<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        function: v8::Local<'s, v8::Function>,
    ) -> HostValue {
        let name = function.get_name(scope).to_rust_string_lossy(scope);
        let global = v8::Global::new(scope, function);
        match registry_mut(scope).and_then(|r| r.store_function(self.context, global)) {
            Some(id) => HostValue::Function(FunctionRef {
                isolate: self.isolate,
                context: self.context,
                id,
                name,
            }),
            None => HostValue::Placeholder(Placeholder::Unsupported("function".into())),
        }
    }
}

struct ToHost<'c, 's> {
    codec: &'c Codec,
    /// Objects currently being copied, outermost first.
    path: Vec<v8::Local<'s, v8::Object>>,
    visited: usize,
}

impl<'c, 's> ToHost<'c, 's> {
    fn value(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> HostValue {
        self.visited += 1;
        if self.visited > self.codec.limits.max_values {
            return HostValue::Placeholder(Placeholder::ValueLimit);
        }

        if value.is_undefined() {
            return HostValue::Undefined;
        }
        if value.is_null() {
            return HostValue::Null;
        }
        if value.is_boolean() {
            return HostValue::Bool(value.is_true());
        }
        if let Ok(number) = v8::Local::<v8::Number>::try_from(value) {
            return HostValue::from_number(number.value());
        }
        if let Ok(s) = v8::Local::<v8::String>::try_from(value) {
            if s.length() > self.codec.limits.max_bytes {
                return HostValue::Placeholder(Placeholder::ValueLimit);
            }
            return HostValue::String(s.to_rust_string_lossy(scope));
        }
        if let Ok(big) = v8::Local::<v8::BigInt>::try_from(value) {
            return match big.i64_value() {
                (i, true) => HostValue::Integer(i),
                _ => HostValue::Placeholder(Placeholder::Unsupported("bigint".into())),
            };
        }
        if value.is_symbol() {
            return HostValue::Placeholder(Placeholder::Unsupported("symbol".into()));
        }
        if value.is_proxy() {
            return HostValue::Placeholder(Placeholder::Unsupported("proxy".into()));
        }
        if let Ok(function) = v8::Local::<v8::Function>::try_from(value) {
            return self.codec.store_function(scope, function);
        }
        if let Ok(date) = v8::Local::<v8::Date>::try_from(value) {
            return HostValue::Date(date.value_of());
        }
        if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) {
            if view.byte_length() > self.codec.limits.max_bytes {
                return HostValue::Placeholder(Placeholder::ValueLimit);
            }
            let mut bytes = vec![0u8; view.byte_length()];
            let copied = view.copy_contents(&mut bytes);
            bytes.truncate(copied);
            return HostValue::Binary(bytes);
        }
        if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(value) {
            if buffer.byte_length() > self.codec.limits.max_bytes {
                return HostValue::Placeholder(Placeholder::ValueLimit);
            }
            return HostValue::Binary(array_buffer_bytes(buffer));
        }
        if let Ok(promise) = v8::Local::<v8::Promise>::try_from(value) {
            return match promise.state() {
                v8::PromiseState::Fulfilled => {
                    let settled = promise.result(scope);
                    self.value(scope, settled, depth)
                }
                _ => HostValue::Placeholder(Placeholder::Unsupported("promise".into())),
            };
        }

        let Some(object) = value.to_object(scope) else {
            return HostValue::Placeholder(Placeholder::Unsupported(type_name(scope, value)));
        };
        if self.path.iter().any(|ancestor| ancestor.strict_equals(object.into())) {
            return HostValue::Placeholder(Placeholder::Cycle);
        }
        if depth >= self.codec.limits.max_depth {
            return HostValue::Placeholder(Placeholder::DepthLimit);
        }

        self.path.push(object);
        let host = if let Ok(array) = v8::Local::<v8::Array>::try_from(value) {
            self.array(scope, array, depth)
        } else if let Ok(map) = v8::Local::<v8::Map>::try_from(value) {
            self.map(scope, map, depth)
        } else if value.is_set()
            || value.is_weak_map()
            || value.is_weak_set()
            || value.is_reg_exp()
        {
            HostValue::Placeholder(Placeholder::Unsupported(type_name(scope, value)))
        } else {
            self.object(scope, object, depth)
        };
        self.path.pop();
        host
    }

    fn array(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        array: v8::Local<'s, v8::Array>,
        depth: usize,
    ) -> HostValue {
        let len = array.length();
        let mut items = Vec::with_capacity((len as usize).min(self.codec.limits.max_values));
        for index in 0..len {
            if self.visited >= self.codec.limits.max_values {
                items.push(HostValue::Placeholder(Placeholder::ValueLimit));
                break;
            }
            let item = match array.get_index(scope, index) {
                Some(item) => self.value(scope, item, depth + 1),
                None => HostValue::Undefined,
            };
            items.push(item);
        }
        HostValue::Array(items)
    }

    fn map(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        map: v8::Local<'s, v8::Map>,
        depth: usize,
    ) -> HostValue {
        // `as_array` flattens to [k0, v0, k1, v1, ...].
        let flat = map.as_array(scope);
        let mut entries = IndexMap::new();
        let mut index = 0;
        while index + 1 < flat.length() {
            if self.visited >= self.codec.limits.max_values {
                mark_truncated(&mut entries);
                break;
            }
            let key = flat
                .get_index(scope, index)
                .and_then(|k| k.to_string(scope))
                .map(|k| k.to_rust_string_lossy(scope))
                .unwrap_or_default();
            let value = match flat.get_index(scope, index + 1) {
                Some(value) => self.value(scope, value, depth + 1),
                None => HostValue::Undefined,
            };
            entries.insert(key, value);
            index += 2;
        }
        HostValue::Object(entries)
    }

    fn object(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
        depth: usize,
    ) -> HostValue {
        let args = v8::GetPropertyNamesArgs {
            mode: v8::KeyCollectionMode::OwnOnly,
            key_conversion: v8::KeyConversionMode::ConvertToString,
            ..Default::default()
        };
        let Some(names) = object.get_own_property_names(scope, args) else {
            return HostValue::Object(IndexMap::new());
        };
        let mut entries = IndexMap::with_capacity(names.length() as usize);
        for index in 0..names.length() {
            if self.visited >= self.codec.limits.max_values {
                mark_truncated(&mut entries);
                break;
            }
            let Some(key) = names.get_index(scope, index) else {
                continue;
            };
            let name = key.to_rust_string_lossy(scope);
            let value = match object.get(scope, key) {
                Some(value) => self.value(scope, value, depth + 1),
                None => HostValue::Undefined,
            };
            entries.insert(name, value);
        }
        HostValue::Object(entries)
    }
}

fn string<'s>(scope: &mut v8::HandleScope<'s>, text: &str) -> v8::Local<'s, v8::Value> {
    match v8::String::new(scope, text) {
        Some(s) => s.into(),
        None => v8::undefined(scope).into(),
    }
}

fn binary<'s>(scope: &mut v8::HandleScope<'s>, bytes: &[u8]) -> v8::Local<'s, v8::Value> {
    let len = bytes.len();
    let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes.to_vec()).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);
    match v8::Uint8Array::new(scope, buffer, 0, len) {
        Some(array) => array.into(),
        None => buffer.into(),
    }
}

/// Ends a truncated object with a value-limit entry under a key that none
/// of the copied entries uses.
fn mark_truncated(entries: &mut IndexMap<String, HostValue>) {
    let mut key = Placeholder::ValueLimit.to_string();
    while entries.contains_key(&key) {
        key.insert(0, '_');
    }
    entries.insert(key, HostValue::Placeholder(Placeholder::ValueLimit));
}

fn array_buffer_bytes(buffer: v8::Local<v8::ArrayBuffer>) -> Vec<u8> {
    let store = buffer.get_backing_store();
    let len = buffer.byte_length();
    store.iter().take(len).map(|cell| cell.get()).collect()
}

fn type_name(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    value.type_of(scope).to_rust_string_lossy(scope)
}
