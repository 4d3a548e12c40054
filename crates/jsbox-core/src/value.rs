use std::fmt;

use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::context::ContextId;
use crate::isolate::IsolateId;

/// Largest integer the engine represents exactly (`Number.MAX_SAFE_INTEGER`).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// A host-side copy of an engine value. Nothing in here points into the
/// engine heap except [`FunctionRef`], which is an arena index.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<HostValue>),
    Object(IndexMap<String, HostValue>),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Function(FunctionRef),
    Binary(Vec<u8>),
    Placeholder(Placeholder),
}

/// Stand-in for engine values that cannot be copied out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Cycle,
    DepthLimit,
    ValueLimit,
    Unsupported(String),
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placeholder::Cycle => f.write_str("[cycle]"),
            Placeholder::DepthLimit => f.write_str("[depth limit]"),
            Placeholder::ValueLimit => f.write_str("[value limit]"),
            Placeholder::Unsupported(kind) => write!(f, "[unsupported {}]", kind),
        }
    }
}

/// Handle to a function that lives in a context's arena. It stays valid until
/// the function is released or its context is disposed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    pub(crate) isolate: IsolateId,
    pub(crate) context: ContextId,
    pub(crate) id: u64,
    pub(crate) name: String,
}

impl FunctionRef {
    pub fn isolate(&self) -> IsolateId {
        self.isolate
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// The function's `name` property at the time it was copied out.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "[function #{}]", self.id)
        } else {
            write!(f, "[function {}]", self.name)
        }
    }
}

impl HostValue {
    /// Classifies an engine number: safe integers become `Integer`, everything
    /// else (fractions, `-0`, NaN, infinities, huge magnitudes) stays `Float`.
    pub fn from_number(n: f64) -> HostValue {
        let is_negative_zero = n == 0.0 && n.is_sign_negative();
        let integral = n.is_finite() && n.fract() == 0.0;
        if integral && n.abs() <= MAX_SAFE_INTEGER as f64 && !is_negative_zero {
            HostValue::Integer(n as i64)
        } else {
            HostValue::Float(n)
        }
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> HostValue {
        HostValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Integer(i) => Some(*i),
            HostValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Integer(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, HostValue>> {
        match self {
            HostValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            HostValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&HostValue> {
        self.as_object().and_then(|map| map.get(key))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Integer(_) => "integer",
            HostValue::Float(_) => "float",
            HostValue::String(_) => "string",
            HostValue::Array(_) => "array",
            HostValue::Object(_) => "object",
            HostValue::Date(_) => "date",
            HostValue::Function(_) => "function",
            HostValue::Binary(_) => "binary",
            HostValue::Placeholder(_) => "placeholder",
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Integer(v as i64)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Integer(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::String(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::String(v)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(v: Vec<HostValue>) -> Self {
        HostValue::Array(v)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(v: Vec<u8>) -> Self {
        HostValue::Binary(v)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(HostValue::Null)
    }
}

impl Serialize for HostValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            HostValue::Undefined | HostValue::Null => serializer.serialize_none(),
            HostValue::Bool(b) => serializer.serialize_bool(*b),
            HostValue::Integer(i) => serializer.serialize_i64(*i),
            HostValue::Float(f) => serializer.serialize_f64(*f),
            HostValue::String(s) => serializer.serialize_str(s),
            HostValue::Date(ms) => serializer.serialize_f64(*ms),
            HostValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            HostValue::Object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            HostValue::Binary(bytes) => serializer.serialize_bytes(bytes),
            HostValue::Function(f) => serializer.collect_str(f),
            HostValue::Placeholder(p) => serializer.collect_str(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_integers_classify_as_integer() {
        assert_eq!(HostValue::from_number(2.0), HostValue::Integer(2));
        assert_eq!(HostValue::from_number(-17.0), HostValue::Integer(-17));
        assert_eq!(
            HostValue::from_number(MAX_SAFE_INTEGER as f64),
            HostValue::Integer(MAX_SAFE_INTEGER)
        );
    }

    #[test]
    fn non_integral_and_unsafe_numbers_stay_float() {
        assert_eq!(HostValue::from_number(1.5), HostValue::Float(1.5));
        assert_eq!(HostValue::from_number(1e300), HostValue::Float(1e300));
        assert_eq!(HostValue::from_number(f64::INFINITY), HostValue::Float(f64::INFINITY));
        assert!(matches!(HostValue::from_number(f64::NAN), HostValue::Float(f) if f.is_nan()));
        match HostValue::from_number(-0.0) {
            HostValue::Float(f) => assert!(f.is_sign_negative()),
            other => panic!("expected float -0, got {:?}", other),
        }
    }

    #[test]
    fn serializes_nested_values_as_json() {
        let value = HostValue::object([
            ("a", HostValue::Integer(1)),
            ("b", HostValue::Array(vec![HostValue::Null, HostValue::from("x")])),
            ("c", HostValue::Placeholder(Placeholder::Cycle)),
        ]);
        let json = serde_json::to_string(&value).unwrap_or_default();
        assert_eq!(json, r#"{"a":1,"b":[null,"x"],"c":"[cycle]"}"#);
    }

    #[test]
    fn object_keeps_insertion_order() {
        let value = HostValue::object([("z", HostValue::from(1)), ("a", HostValue::from(2))]);
        let keys: Vec<&str> = value
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        assert_eq!(keys, vec!["z", "a"]);
    }
}
