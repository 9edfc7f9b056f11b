//! Operations: tagged mutation records describing one change to a value tree.
//!
//! Wire form is `{path, method, args}`. `update`/`delete` address the
//! containing node and name the member in `args.prop`; `add` addresses the
//! new member itself (key escaped into the path) and carries the raw key in
//! `args.prop`; sequence mutators address the sequence and carry their
//! literal call arguments in `args.mutatorArgs`.

use crate::path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The recognized sequence mutators, matching JavaScript array method
/// semantics on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SeqMethod {
    CopyWithin,
    Fill,
    Pop,
    Push,
    Reverse,
    Shift,
    Sort,
    Splice,
    Unshift,
}

impl SeqMethod {
    pub const ALL: [SeqMethod; 9] = [
        SeqMethod::CopyWithin,
        SeqMethod::Fill,
        SeqMethod::Pop,
        SeqMethod::Push,
        SeqMethod::Reverse,
        SeqMethod::Shift,
        SeqMethod::Sort,
        SeqMethod::Splice,
        SeqMethod::Unshift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SeqMethod::CopyWithin => "copyWithin",
            SeqMethod::Fill => "fill",
            SeqMethod::Pop => "pop",
            SeqMethod::Push => "push",
            SeqMethod::Reverse => "reverse",
            SeqMethod::Shift => "shift",
            SeqMethod::Sort => "sort",
            SeqMethod::Splice => "splice",
            SeqMethod::Unshift => "unshift",
        }
    }
}

impl std::fmt::Display for SeqMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method + arguments of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OpKind {
    /// Replace the subtree at `path` wholesale.
    Overwrite { new_value: Value },
    /// Introduce a member that did not exist before.
    Add { prop: String, new_value: Value },
    /// Reassign an existing member.
    Update { prop: String, new_value: Value },
    /// Remove a member.
    Delete { prop: String },
    CopyWithin { prop: String, mutator_args: Vec<Value> },
    Fill { prop: String, mutator_args: Vec<Value> },
    Pop { prop: String, mutator_args: Vec<Value> },
    Push { prop: String, mutator_args: Vec<Value> },
    Reverse { prop: String, mutator_args: Vec<Value> },
    Shift { prop: String, mutator_args: Vec<Value> },
    Sort { prop: String, mutator_args: Vec<Value> },
    Splice { prop: String, mutator_args: Vec<Value> },
    Unshift { prop: String, mutator_args: Vec<Value> },
}

impl OpKind {
    pub fn method_name(&self) -> &'static str {
        match self {
            OpKind::Overwrite { .. } => "overwrite",
            OpKind::Add { .. } => "add",
            OpKind::Update { .. } => "update",
            OpKind::Delete { .. } => "delete",
            OpKind::CopyWithin { .. } => "copyWithin",
            OpKind::Fill { .. } => "fill",
            OpKind::Pop { .. } => "pop",
            OpKind::Push { .. } => "push",
            OpKind::Reverse { .. } => "reverse",
            OpKind::Shift { .. } => "shift",
            OpKind::Sort { .. } => "sort",
            OpKind::Splice { .. } => "splice",
            OpKind::Unshift { .. } => "unshift",
        }
    }

    /// The sequence mutator this operation invokes, if it is one.
    pub fn seq_method(&self) -> Option<SeqMethod> {
        self.mutator_parts().map(|(method, _)| method)
    }

    /// Mutator method plus its literal call arguments, for mutator kinds.
    pub fn mutator_parts(&self) -> Option<(SeqMethod, &[Value])> {
        match self {
            OpKind::CopyWithin { mutator_args, .. } => Some((SeqMethod::CopyWithin, mutator_args)),
            OpKind::Fill { mutator_args, .. } => Some((SeqMethod::Fill, mutator_args)),
            OpKind::Pop { mutator_args, .. } => Some((SeqMethod::Pop, mutator_args)),
            OpKind::Push { mutator_args, .. } => Some((SeqMethod::Push, mutator_args)),
            OpKind::Reverse { mutator_args, .. } => Some((SeqMethod::Reverse, mutator_args)),
            OpKind::Shift { mutator_args, .. } => Some((SeqMethod::Shift, mutator_args)),
            OpKind::Sort { mutator_args, .. } => Some((SeqMethod::Sort, mutator_args)),
            OpKind::Splice { mutator_args, .. } => Some((SeqMethod::Splice, mutator_args)),
            OpKind::Unshift { mutator_args, .. } => Some((SeqMethod::Unshift, mutator_args)),
            _ => None,
        }
    }
}

/// One mutation against a replicant's value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub path: String,
    #[serde(flatten)]
    pub kind: OpKind,
}

impl Operation {
    /// Wholesale replacement of the root value.
    pub fn overwrite(new_value: Value) -> Self {
        Self {
            path: path::ROOT.to_string(),
            kind: OpKind::Overwrite { new_value },
        }
    }

    /// A new member `prop` of the container at `container_path`.
    pub fn add(container_path: &str, prop: impl Into<String>, new_value: Value) -> Self {
        let prop = prop.into();
        Self {
            path: path::join(container_path, &prop),
            kind: OpKind::Add { prop, new_value },
        }
    }

    /// Reassignment of the existing member `prop` of the container at `path`.
    pub fn update(container_path: &str, prop: impl Into<String>, new_value: Value) -> Self {
        Self {
            path: container_path.to_string(),
            kind: OpKind::Update {
                prop: prop.into(),
                new_value,
            },
        }
    }

    /// Removal of member `prop` of the container at `path`.
    pub fn delete(container_path: &str, prop: impl Into<String>) -> Self {
        Self {
            path: container_path.to_string(),
            kind: OpKind::Delete { prop: prop.into() },
        }
    }

    /// A sequence mutator invoked on the sequence at `seq_path` with the
    /// literal call arguments.
    pub fn sequence(seq_path: &str, method: SeqMethod, mutator_args: Vec<Value>) -> Self {
        let prop = path::last_segment(seq_path).unwrap_or_default();
        let kind = match method {
            SeqMethod::CopyWithin => OpKind::CopyWithin { prop, mutator_args },
            SeqMethod::Fill => OpKind::Fill { prop, mutator_args },
            SeqMethod::Pop => OpKind::Pop { prop, mutator_args },
            SeqMethod::Push => OpKind::Push { prop, mutator_args },
            SeqMethod::Reverse => OpKind::Reverse { prop, mutator_args },
            SeqMethod::Shift => OpKind::Shift { prop, mutator_args },
            SeqMethod::Sort => OpKind::Sort { prop, mutator_args },
            SeqMethod::Splice => OpKind::Splice { prop, mutator_args },
            SeqMethod::Unshift => OpKind::Unshift { prop, mutator_args },
        };
        Self {
            path: seq_path.to_string(),
            kind,
        }
    }
}

/// Decode failures at the wire boundary.
///
/// An unrecognized method is distinguished from garden-variety malformed
/// JSON because the former is a programmer error on the sending side and is
/// treated as fatal by the receiver.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown operation method {method:?}")]
    UnknownMethod { method: String },

    #[error("malformed operation: {0}")]
    Malformed(String),
}

const KNOWN_METHODS: &[&str] = &[
    "overwrite",
    "add",
    "update",
    "delete",
    "copyWithin",
    "fill",
    "pop",
    "push",
    "reverse",
    "shift",
    "sort",
    "splice",
    "unshift",
];

impl Operation {
    /// Decode an operation from raw JSON, classifying unknown methods.
    pub fn from_wire(raw: &Value) -> Result<Self, WireError> {
        if let Some(method) = raw.get("method").and_then(Value::as_str) {
            if !KNOWN_METHODS.contains(&method) {
                return Err(WireError::UnknownMethod {
                    method: method.to_string(),
                });
            }
        }
        serde_json::from_value(raw.clone()).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn update_wire_shape() {
        let op = Operation::update("/a/b", "1", json!(9));
        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(
            wire,
            json!({"path": "/a/b", "method": "update", "args": {"prop": "1", "newValue": 9}})
        );
    }

    #[test]
    fn add_path_includes_escaped_key() {
        let op = Operation::add("/", "a/b", json!(1));
        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(
            wire,
            json!({"path": "/a~1b", "method": "add", "args": {"prop": "a/b", "newValue": 1}})
        );
    }

    #[test]
    fn push_carries_literal_args() {
        let op = Operation::sequence("/xs", SeqMethod::Push, vec![json!(4), json!(5)]);
        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(
            wire,
            json!({"path": "/xs", "method": "push", "args": {"prop": "xs", "mutatorArgs": [4, 5]}})
        );
    }

    #[test]
    fn operation_roundtrip() {
        let ops = vec![
            Operation::overwrite(json!({"a": 1})),
            Operation::add("/a", "b", json!([1, 2])),
            Operation::update("/a", "b", json!(null)),
            Operation::delete("/a", "b"),
            Operation::sequence("/a/b", SeqMethod::Splice, vec![json!(1), json!(2), json!("x")]),
            Operation::sequence("/a/b", SeqMethod::Sort, vec![]),
        ];
        for op in ops {
            let json = serde_json::to_string(&op).unwrap();
            let parsed: Operation = serde_json::from_str(&json).unwrap();
            assert_eq!(op, parsed);
        }
    }

    #[test]
    fn from_wire_rejects_unknown_method() {
        let raw = json!({"path": "/", "method": "transmogrify", "args": {}});
        let err = Operation::from_wire(&raw).unwrap_err();
        assert!(matches!(err, WireError::UnknownMethod { method } if method == "transmogrify"));
    }

    #[test]
    fn from_wire_accepts_known_method() {
        let raw = json!({"path": "/xs", "method": "pop", "args": {"prop": "xs", "mutatorArgs": []}});
        let op = Operation::from_wire(&raw).unwrap();
        assert_eq!(op.kind.seq_method(), Some(SeqMethod::Pop));
    }
}
