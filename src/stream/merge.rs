//! Delta merging for streamed records.
//!
//! Completion services and tools deliver output as partial JSON fragments. [`merge`] folds a
//! fragment into the accumulated record, recursing through objects so that nested fields such
//! as `function_call.arguments` accumulate independently.

use serde_json::{Map, Value};

/// How a fragment combines with the value already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Concatenate strings and arrays, sum numbers.
    Add,
    /// Overwrite.
    Set,
}

/// Merge `value` into `target` and return the result.
///
/// `Null` stands for "absent": `Null` with `Null` stays `Null`, and a `Null` target receiving a
/// string behaves like `""`. Objects merge key by key, creating missing keys. In `Add` mode a
/// scalar type mismatch resolves to the incoming value.
pub fn merge(mode: MergeMode, target: Value, value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut target = match target {
                Value::Object(existing) => existing,
                _ => Map::new(),
            };
            for (key, field) in fields {
                let current = target.remove(&key).unwrap_or(Value::Null);
                target.insert(key, merge(mode, current, field));
            }
            Value::Object(target)
        }
        value => match mode {
            MergeMode::Set => value,
            MergeMode::Add => add(target, value),
        },
    }
}

/// Merge in place.
pub fn merge_into(mode: MergeMode, target: &mut Value, value: Value) {
    let current = std::mem::take(target);
    *target = merge(mode, current, value);
}

fn add(target: Value, value: Value) -> Value {
    match (target, value) {
        (target, Value::Null) => target,
        (Value::Null, Value::String(s)) => Value::String(s),
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Value::String(a)
        }
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Value::Array(a)
        }
        (Value::Number(a), Value::Number(b)) => sum(&a, &b).unwrap_or(Value::Number(b)),
        (_, value) => value,
    }
}

fn sum(a: &serde_json::Number, b: &serde_json::Number) -> Option<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(Value::from(x.checked_add(y)?));
    }
    let total = a.as_f64()? + b.as_f64()?;
    serde_json::Number::from_f64(total).map(Value::Number)
}
