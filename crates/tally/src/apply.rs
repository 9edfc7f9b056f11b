//! Applying operations to a raw value tree.
//!
//! This is the single code path for mutations: local writes go through it on
//! the authority after validation, and every inbound operation goes through
//! it (under suspension) on both sides. Replaying an emitted batch against
//! the pre-batch value therefore reproduces the post-batch value.

use crate::errors::ReplicantError;
use crate::mutators;
use serde_json::Value;
use tallyproto::{path, OpKind, Operation};

/// Resolve a path to a shared reference into the tree.
pub fn resolve<'a>(root: &'a Value, target: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path::segments(target) {
        current = match current {
            Value::Object(map) => map.get(&segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a path to a mutable reference into the tree.
fn resolve_mut<'a>(root: &'a mut Value, target: &str) -> Result<&'a mut Value, ReplicantError> {
    let mut current = root;
    for segment in path::segments(target) {
        current = match current {
            Value::Object(map) => map.get_mut(&segment).ok_or_else(|| missing(target, &segment))?,
            Value::Array(items) => {
                let idx: usize = segment
                    .parse()
                    .map_err(|_| bad_index(target, &segment))?;
                items.get_mut(idx).ok_or_else(|| missing(target, &segment))?
            }
            _ => {
                return Err(ReplicantError::InvalidPath {
                    path: target.to_string(),
                    reason: format!("{:?} is not a container", segment),
                })
            }
        };
    }
    Ok(current)
}

fn missing(target: &str, segment: &str) -> ReplicantError {
    ReplicantError::InvalidPath {
        path: target.to_string(),
        reason: format!("no member {:?}", segment),
    }
}

fn bad_index(target: &str, segment: &str) -> ReplicantError {
    ReplicantError::InvalidPath {
        path: target.to_string(),
        reason: format!("{:?} is not a sequence index", segment),
    }
}

/// Read a member of a container.
pub fn get_member<'a>(container: &'a Value, prop: &str) -> Option<&'a Value> {
    match container {
        Value::Object(map) => map.get(prop),
        Value::Array(items) => items.get(prop.parse::<usize>().ok()?),
        _ => None,
    }
}

/// Set a member of a container. Writing past the end of a sequence pads the
/// gap with nulls, matching how holes serialize.
pub fn set_member(container: &mut Value, prop: &str, value: Value) -> Result<(), ReplicantError> {
    match container {
        Value::Object(map) => {
            map.insert(prop.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx: usize = prop.parse().map_err(|_| bad_index(prop, prop))?;
            if idx >= items.len() {
                items.resize(idx + 1, Value::Null);
            }
            items[idx] = value;
            Ok(())
        }
        _ => Err(ReplicantError::InvalidPath {
            path: prop.to_string(),
            reason: "target is not a container".to_string(),
        }),
    }
}

/// Remove a member of a container. Absent members succeed trivially; removing
/// a sequence element leaves a null, matching delete-on-index semantics.
pub fn delete_member(container: &mut Value, prop: &str) {
    match container {
        Value::Object(map) => {
            map.remove(prop);
        }
        Value::Array(items) => {
            if let Ok(idx) = prop.parse::<usize>() {
                if idx < items.len() {
                    items[idx] = Value::Null;
                }
            }
        }
        _ => {}
    }
}

/// Apply one operation to the tree. Returns the mutator's return value for
/// sequence mutators, `None` otherwise.
pub fn apply_to_tree(
    root: &mut Option<Value>,
    op: &Operation,
) -> Result<Option<Value>, ReplicantError> {
    match &op.kind {
        OpKind::Overwrite { new_value } => {
            match path::split_last(&op.path) {
                None => *root = Some(new_value.clone()),
                Some((container_path, prop)) => {
                    let tree = require_root(root, &op.path)?;
                    let container = resolve_mut(tree, &container_path)?;
                    set_member(container, &prop, new_value.clone())?;
                }
            }
            Ok(None)
        }
        OpKind::Add { prop, new_value } => {
            // An add addresses the new member itself; its container is one
            // level up.
            let (container_path, _) = path::split_last(&op.path).ok_or_else(|| {
                ReplicantError::InvalidPath {
                    path: op.path.clone(),
                    reason: "cannot add at the root".to_string(),
                }
            })?;
            let tree = require_root(root, &op.path)?;
            let container = resolve_mut(tree, &container_path)?;
            set_member(container, prop, new_value.clone())?;
            Ok(None)
        }
        OpKind::Update { prop, new_value } => {
            let tree = require_root(root, &op.path)?;
            let container = resolve_mut(tree, &op.path)?;
            set_member(container, prop, new_value.clone())?;
            Ok(None)
        }
        OpKind::Delete { prop } => {
            let tree = require_root(root, &op.path)?;
            let container = resolve_mut(tree, &op.path)?;
            delete_member(container, prop);
            Ok(None)
        }
        other => {
            let (method, args) = match other.mutator_parts() {
                Some((method, args)) => (method, args.to_vec()),
                None => {
                    return Err(ReplicantError::UnknownOperationMethod {
                        method: other.method_name().to_string(),
                    })
                }
            };
            let tree = require_root(root, &op.path)?;
            let target = resolve_mut(tree, &op.path)?;
            match target {
                Value::Array(items) => Ok(mutators::apply(method, items, &args)),
                _ => Err(ReplicantError::InvalidPath {
                    path: op.path.clone(),
                    reason: format!("{} requires a sequence", method),
                }),
            }
        }
    }
}

fn require_root<'a>(
    root: &'a mut Option<Value>,
    target: &str,
) -> Result<&'a mut Value, ReplicantError> {
    root.as_mut().ok_or_else(|| ReplicantError::InvalidPath {
        path: target.to_string(),
        reason: "value is undefined".to_string(),
    })
}

/// Replay a batch in order against a starting value.
pub fn replay(start: Option<Value>, operations: &[Operation]) -> Result<Option<Value>, ReplicantError> {
    let mut value = start;
    for op in operations {
        apply_to_tree(&mut value, op)?;
    }
    Ok(value)
}
