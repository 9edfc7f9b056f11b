//! Error types for the replicant core.
//!
//! Library errors are typed; the daemon edge converts them to the wire
//! envelope via [`ReplicantError::to_sync_error`].

use crate::schema::{SchemaError, SchemaViolation};
use serde_json::{json, Value};
use tallyproto::{ErrorKind, SyncError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicantError {
    /// A proposed mutation would violate the replicant's schema.
    #[error("schema validation failed for {namespace}/{name}: {} violation(s)", violations.len())]
    SchemaValidation {
        namespace: String,
        name: String,
        violations: Vec<SchemaViolation>,
    },

    /// A composite owned by one replicant was grafted into another.
    #[error("value at {path} belongs to {owner}, cannot graft into {target}")]
    CrossOwnership {
        owner: String,
        target: String,
        path: String,
        value: Value,
    },

    /// Empty name/namespace, or a redeclaration with conflicting options.
    #[error("invalid declaration of {namespace}/{name}: {reason}")]
    InvalidDeclaration {
        namespace: String,
        name: String,
        reason: String,
    },

    /// A frame referenced a replicant not present on this side.
    #[error("unknown replicant {namespace}/{name}")]
    UnknownReplicant { namespace: String, name: String },

    /// The replicant has not finished declaring on this side.
    #[error("replicant {namespace}/{name} is not declared yet")]
    Undeclared { namespace: String, name: String },

    /// An inbound operation used a method this build does not know.
    /// Programmer error on the sending side; fatal at the receiving edge.
    #[error("unknown operation method {method:?}")]
    UnknownOperationMethod { method: String },

    /// An inbound frame failed to decode.
    #[error("malformed sync frame: {message}")]
    MalformedFrame { message: String },

    /// An operation path did not resolve against the current value tree.
    #[error("path {path} does not resolve: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("failed to persist replicant state: {0}")]
    Persistence(#[from] std::io::Error),
}

impl ReplicantError {
    /// The wire category this error maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplicantError::SchemaValidation { .. } => ErrorKind::SchemaValidationError,
            ReplicantError::CrossOwnership { .. } => ErrorKind::CrossOwnershipError,
            ReplicantError::UnknownReplicant { .. } => ErrorKind::UnknownReplicant,
            ReplicantError::Undeclared { .. } => ErrorKind::UndeclaredReplicant,
            _ => ErrorKind::InternalError,
        }
    }

    /// Convert to the wire error envelope, attaching structured details
    /// where the category defines them.
    pub fn to_sync_error(&self) -> SyncError {
        let mut err = SyncError::new(self.kind(), self.to_string());
        match self {
            ReplicantError::SchemaValidation { violations, .. } => {
                if let Ok(details) = serde_json::to_value(violations) {
                    err = err.with_details(details);
                }
            }
            ReplicantError::CrossOwnership {
                owner,
                target,
                path,
                value,
            } => {
                err = err.with_details(json!({
                    "owner": owner,
                    "target": target,
                    "path": path,
                    "value": value,
                }));
            }
            _ => {}
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_kinds() {
        let err = ReplicantError::UnknownReplicant {
            namespace: "bundle".to_string(),
            name: "missing".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::UnknownReplicant);

        let err = ReplicantError::InvalidPath {
            path: "/nope".to_string(),
            reason: "no such member".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }

    #[test]
    fn cross_ownership_details() {
        let err = ReplicantError::CrossOwnership {
            owner: "bundle/a".to_string(),
            target: "bundle/b".to_string(),
            path: "/x".to_string(),
            value: json!({"k": 1}),
        };
        let sync = err.to_sync_error();
        assert_eq!(sync.kind, ErrorKind::CrossOwnershipError);
        let details = sync.details.unwrap();
        assert_eq!(details["owner"], "bundle/a");
        assert_eq!(details["value"]["k"], 1);
    }
}
