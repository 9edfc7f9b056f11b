//! Sequence mutators with JavaScript argument semantics.
//!
//! Operations carry the literal arguments of the originating call, so the
//! apply side has to reproduce `Array.prototype` behavior: index coercion,
//! negative-index normalization, and the default string sort.

use serde_json::{json, Value};
use tallyproto::SeqMethod;

/// Apply a mutator to a sequence, returning what the JavaScript call would
/// have returned where that is a value (removed element, new length). Calls
/// that return the array itself yield `None`.
pub fn apply(method: SeqMethod, seq: &mut Vec<Value>, args: &[Value]) -> Option<Value> {
    match method {
        SeqMethod::CopyWithin => {
            copy_within(seq, args);
            None
        }
        SeqMethod::Fill => {
            fill(seq, args);
            None
        }
        SeqMethod::Pop => seq.pop(),
        SeqMethod::Push => {
            seq.extend(args.iter().cloned());
            Some(json!(seq.len()))
        }
        SeqMethod::Reverse => {
            seq.reverse();
            None
        }
        SeqMethod::Shift => {
            if seq.is_empty() {
                None
            } else {
                Some(seq.remove(0))
            }
        }
        SeqMethod::Sort => {
            seq.sort_by(|a, b| js_string(a).cmp(&js_string(b)));
            None
        }
        SeqMethod::Splice => Some(Value::Array(splice(seq, args))),
        SeqMethod::Unshift => {
            for (i, item) in args.iter().enumerate() {
                seq.insert(i, item.clone());
            }
            Some(json!(seq.len()))
        }
    }
}

/// Integer coercion: numbers truncate, everything else is 0.
fn to_index(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Normalize a possibly-negative index against a length.
fn normalize(idx: i64, len: usize) -> usize {
    let len = len as i64;
    let idx = if idx < 0 { (len + idx).max(0) } else { idx.min(len) };
    idx as usize
}

fn copy_within(seq: &mut [Value], args: &[Value]) {
    let len = seq.len();
    let to = normalize(to_index(args.first()), len);
    let from = normalize(to_index(args.get(1)), len);
    let end = match args.get(2) {
        Some(v) => normalize(to_index(Some(v)), len),
        None => len,
    };
    let count = end.saturating_sub(from).min(len - to);
    let src: Vec<Value> = seq[from..from + count].to_vec();
    seq[to..to + count].clone_from_slice(&src);
}

fn fill(seq: &mut [Value], args: &[Value]) {
    let len = seq.len();
    let value = args.first().cloned().unwrap_or(Value::Null);
    let start = normalize(to_index(args.get(1)), len);
    let end = match args.get(2) {
        Some(v) => normalize(to_index(Some(v)), len),
        None => len,
    };
    for slot in seq[start..end.max(start)].iter_mut() {
        *slot = value.clone();
    }
}

fn splice(seq: &mut Vec<Value>, args: &[Value]) -> Vec<Value> {
    let len = seq.len();
    let start = normalize(to_index(args.first()), len);
    let delete_count = if args.is_empty() {
        0
    } else if args.len() == 1 {
        len - start
    } else {
        (to_index(args.get(1)).max(0) as usize).min(len - start)
    };
    let removed: Vec<Value> = seq.drain(start..start + delete_count).collect();
    for (i, item) in args.iter().skip(2).enumerate() {
        seq.insert(start + i, item.clone());
    }
    removed
}

/// The string a JS engine would produce for the default sort comparator.
fn js_string(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(js_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}
