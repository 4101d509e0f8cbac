//! # Dynamic Values / 动态值
//!
//! A small dynamic value graph used for thrown payloads and fixture data that
//! has to cross a worker boundary. Arrays and objects are shared handles, so a
//! `Value` can describe cyclic structures; converting it into a transportable
//! form is the job of [`crate::core::transport`].
//!
//! 一个小型动态值图，用于需要跨越 worker 边界的抛出载荷和夹具数据。
//! 数组和对象是共享句柄，因此 `Value` 可以描述循环结构；
//! 将其转换为可传输的形式由 [`crate::core::transport`] 负责。

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// A shared, mutable array. Cloning the handle does not copy the elements.
#[derive(Clone, Default)]
pub struct ArrayRef(Arc<Mutex<Vec<Value>>>);

/// A shared, mutable object with insertion-ordered keys.
#[derive(Clone, Default)]
pub struct ObjectRef(Arc<Mutex<Vec<(String, Value)>>>);

/// A dynamic value.
///
/// 动态值。`Circular` 和 `Unrepresentable` 是序列化层写入的哨兵形式，
/// 反序列化时会原样保留，以保证再次序列化是幂等的。
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(ArrayRef),
    Object(ObjectRef),
    /// A callable, known only by name.
    Function(String),
    /// Any other value; only its `Debug` rendering survives transport.
    Opaque(Arc<dyn fmt::Debug + Send + Sync>),
    /// Sentinel standing in for a reference that closed a cycle.
    Circular,
    /// Sentinel holding the debug rendering of a non-transportable value.
    Unrepresentable(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned lock still holds usable data; never propagate the panic.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ArrayRef {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(Mutex::new(items)))
    }

    pub fn push(&self, value: Value) {
        lock(&self.0).push(value);
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clones the element handles out of the lock.
    pub fn snapshot(&self) -> Vec<Value> {
        lock(&self.0).clone()
    }

    /// Identity of the underlying allocation.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl ObjectRef {
    pub fn new(entries: Vec<(String, Value)>) -> Self {
        Self(Arc::new(Mutex::new(entries)))
    }

    /// Inserts or replaces `key`, keeping the original position on replace.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut entries = lock(&self.0);
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.0)
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(String, Value)> {
        lock(&self.0).clone()
    }

    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl Value {
    /// Builds a fresh object from ordered entries.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(ObjectRef::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Builds a fresh array.
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(ArrayRef::new(items.into_iter().collect()))
    }

    pub fn function(name: impl Into<String>) -> Self {
        Value::Function(name.into())
    }

    pub fn opaque<T: fmt::Debug + Send + Sync + 'static>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Value::Circular | Value::Unrepresentable(_))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Structural equality. Comparing two cyclic graphs does not terminate; run
/// them through the serialization layer first.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) | (Value::Circular, Value::Circular) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b))
            | (Value::Function(a), Value::Function(b))
            | (Value::Unrepresentable(a), Value::Unrepresentable(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.id() == b.id() || a.snapshot() == b.snapshot(),
            (Value::Object(a), Value::Object(b)) => {
                a.id() == b.id() || a.snapshot() == b.snapshot()
            }
            (Value::Opaque(a), Value::Opaque(b)) => format!("{a:?}") == format!("{b:?}"),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Rendering goes through the cycle-safe transport form.
        write!(f, "{}", crate::core::transport::serialize(self))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_set_keeps_position_on_replace() {
        let obj = ObjectRef::new(vec![]);
        obj.set("a", Value::from(1));
        obj.set("b", Value::from(2));
        obj.set("a", Value::from(3));

        let keys: Vec<_> = obj.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(obj.get("a"), Some(Value::Int(3)));
    }

    #[test]
    fn cloned_handles_share_storage() {
        let arr = ArrayRef::new(vec![]);
        let alias = arr.clone();
        alias.push(Value::from("x"));
        assert_eq!(arr.len(), 1);
        assert_eq!(arr.id(), alias.id());
    }

    #[test]
    fn structural_equality_ignores_identity() {
        let a = Value::object([("k", Value::array([Value::from(1), Value::Null]))]);
        let b = Value::object([("k", Value::array([Value::from(1), Value::Null]))]);
        assert_eq!(a, b);
        assert_ne!(a, Value::object([("k", Value::array([]))]));
    }

    #[test]
    fn debug_output_of_a_cycle_terminates() {
        let obj = ObjectRef::new(vec![]);
        obj.set("me", Value::Object(obj.clone()));
        let rendered = format!("{:?}", Value::Object(obj));
        assert!(rendered.contains("[Circular]"));
    }
}
