//! # Serialization Layer / 序列化层
//!
//! Everything that crosses a worker boundary goes through this module:
//! dynamic [`Value`] graphs are flattened into the closed [`Transport`]
//! variant (cycles become a sentinel, non-transportable values become debug
//! strings), and protocol messages are framed as single JSON lines.
//!
//! 所有跨越 worker 边界的数据都经过此模块：动态 [`Value`] 图被展平为封闭的
//! [`Transport`] 变体（循环变为哨兵，不可传输的值变为调试字符串），
//! 协议消息则被编码为单行 JSON。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::core::events::RunEvent;
use crate::core::models::{TaskResult, WorkerTask};
use crate::core::value::{ArrayRef, ObjectRef, Value};

/// Marks a stdout line as a protocol frame. Anything else a worker prints is
/// treated as plain output.
pub const FRAME_PREFIX: &str = "\u{1e}grove:";

/// Nesting beyond this depth is cut off with an `Unrepresentable` marker.
///
/// An object level costs three JSON levels on the wire and serde_json stops
/// decoding at 128, so a full result frame around the deepest payload must
/// stay below that.
pub const MAX_DEPTH: usize = 32;

const CIRCULAR_MARKER: &str = "[Circular]";

/// Primitive payloads pass through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Transportable, acyclic form of a [`Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Transport {
    Primitive(Primitive),
    Object(Vec<(String, Transport)>),
    Array(Vec<Transport>),
    Circular,
    Unrepresentable(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed protocol frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to encode protocol frame: {0}")]
    Encode(serde_json::Error),
}

/// Copies `value` into its transport form.
///
/// Only references on the current path count as "seen", so a reference
/// shared by two siblings is copied twice while a reference that points back
/// at an ancestor becomes [`Transport::Circular`]. Never panics.
pub fn serialize(value: &Value) -> Transport {
    let mut path = HashSet::new();
    copy(value, &mut path, 0)
}

fn copy(value: &Value, path: &mut HashSet<usize>, depth: usize) -> Transport {
    if depth > MAX_DEPTH {
        return Transport::Unrepresentable("[Max depth exceeded]".to_string());
    }
    match value {
        Value::Null => Transport::Primitive(Primitive::Null),
        Value::Bool(b) => Transport::Primitive(Primitive::Bool(*b)),
        Value::Int(i) => Transport::Primitive(Primitive::Int(*i)),
        // JSON has no spelling for these; serde_json would write `null`.
        Value::Float(f) if f.is_nan() => Transport::Unrepresentable("NaN".to_string()),
        Value::Float(f) if f.is_infinite() => {
            let text = if f.is_sign_positive() { "Infinity" } else { "-Infinity" };
            Transport::Unrepresentable(text.to_string())
        }
        Value::Float(f) => Transport::Primitive(Primitive::Float(*f)),
        Value::Str(s) => Transport::Primitive(Primitive::Str(s.clone())),
        Value::Array(arr) => {
            let id = arr.id();
            if !path.insert(id) {
                return Transport::Circular;
            }
            let items = arr
                .snapshot()
                .iter()
                .map(|item| copy(item, path, depth + 1))
                .collect();
            path.remove(&id);
            Transport::Array(items)
        }
        Value::Object(obj) => {
            let id = obj.id();
            if !path.insert(id) {
                return Transport::Circular;
            }
            let entries = obj
                .snapshot()
                .into_iter()
                .map(|(key, item)| {
                    let copied = copy(&item, path, depth + 1);
                    (key, copied)
                })
                .collect();
            path.remove(&id);
            Transport::Object(entries)
        }
        Value::Function(name) if name.is_empty() => {
            Transport::Unrepresentable("[Function anonymous]".to_string())
        }
        Value::Function(name) => Transport::Unrepresentable(format!("[Function {name}]")),
        Value::Opaque(inner) => Transport::Unrepresentable(format!("{inner:?}")),
        Value::Circular => Transport::Circular,
        Value::Unrepresentable(text) => Transport::Unrepresentable(text.clone()),
    }
}

/// Rebuilds a live value. Sentinels come back as sentinels.
pub fn deserialize(transport: &Transport) -> Value {
    match transport {
        Transport::Primitive(Primitive::Null) => Value::Null,
        Transport::Primitive(Primitive::Bool(b)) => Value::Bool(*b),
        Transport::Primitive(Primitive::Int(i)) => Value::Int(*i),
        Transport::Primitive(Primitive::Float(f)) => Value::Float(*f),
        Transport::Primitive(Primitive::Str(s)) => Value::Str(s.clone()),
        Transport::Array(items) => Value::Array(ArrayRef::new(
            items.iter().map(deserialize).collect(),
        )),
        Transport::Object(entries) => Value::Object(ObjectRef::new(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), deserialize(v)))
                .collect(),
        )),
        Transport::Circular => Value::Circular,
        Transport::Unrepresentable(text) => Value::Unrepresentable(text.clone()),
    }
}

impl Transport {
    /// True if no sentinel occurs anywhere in the tree.
    pub fn is_faithful(&self) -> bool {
        match self {
            Transport::Primitive(_) => true,
            Transport::Array(items) => items.iter().all(Transport::is_faithful),
            Transport::Object(entries) => entries.iter().all(|(_, v)| v.is_faithful()),
            Transport::Circular | Transport::Unrepresentable(_) => false,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Primitive(Primitive::Null) => f.write_str("null"),
            Transport::Primitive(Primitive::Bool(b)) => write!(f, "{b}"),
            Transport::Primitive(Primitive::Int(i)) => write!(f, "{i}"),
            Transport::Primitive(Primitive::Float(x)) => write!(f, "{x:?}"),
            Transport::Primitive(Primitive::Str(s)) => write!(f, "{s:?}"),
            Transport::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Transport::Object(entries) => {
                f.write_str("{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {item}")?;
                }
                f.write_str("}")
            }
            Transport::Circular => f.write_str(CIRCULAR_MARKER),
            Transport::Unrepresentable(text) => f.write_str(text),
        }
    }
}

/// Messages from the dispatcher to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    Run { task: WorkerTask },
    /// Stop after the current test case.
    Cancel,
    /// Exit once idle.
    Shutdown,
}

/// Messages from a worker back to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    Event { event: RunEvent },
    Done { result: TaskResult },
}

/// Encodes a message as one prefixed JSON line (without the newline).
pub fn encode<T: Serialize>(message: &T) -> Result<String, TransportError> {
    let json = serde_json::to_string(message).map_err(TransportError::Encode)?;
    Ok(format!("{FRAME_PREFIX}{json}"))
}

/// Splits a line into the plain text ahead of a frame and the frame's JSON.
///
/// A test that prints without a trailing newline leaves its text in front of
/// the next frame on the same line.
pub fn split_frame(line: &str) -> (&str, Option<&str>) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.find(FRAME_PREFIX) {
        Some(at) => (&line[..at], Some(&line[at + FRAME_PREFIX.len()..])),
        None => (line, None),
    }
}

/// Parses the JSON body of a frame.
pub fn parse<T: for<'de> Deserialize<'de>>(json: &str) -> Result<T, TransportError> {
    Ok(serde_json::from_str(json)?)
}

/// Decodes a line. Returns `Ok(None)` for lines that carry no protocol frame.
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<Option<T>, TransportError> {
    split_frame(line).1.map(parse::<T>).transpose()
}
