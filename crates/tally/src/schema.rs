//! JSON Schema gate: compile once at declare time, dry-run every mutation.
//!
//! The compiled validator is greedy (reports every violation, not just the
//! first), so a rejected mutation carries the full failure report.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors loading or compiling a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse schema {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to compile schema: {message}")]
    Compile { message: String },
}

/// One recorded violation from a failed validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// Location of the offending value inside the instance.
    pub field: String,
    /// Human-readable description of the failure.
    pub message: String,
    /// Location of the violated constraint inside the schema.
    pub constraint: String,
    /// The offending value itself.
    pub value: Value,
}

/// A compiled schema plus its content sum.
pub struct SchemaGate {
    raw: Value,
    sum: String,
    validator: jsonschema::Validator,
}

impl fmt::Debug for SchemaGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaGate").field("sum", &self.sum).finish()
    }
}

impl SchemaGate {
    /// Compile a schema from an in-memory JSON value.
    pub fn from_value(raw: Value) -> Result<Self, SchemaError> {
        let sum = schema_sum(&raw);
        let validator = jsonschema::validator_for(&raw).map_err(|e| SchemaError::Compile {
            message: e.to_string(),
        })?;
        Ok(Self { raw, sum, validator })
    }

    /// Load and compile a schema from disk.
    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let contents = std::fs::read_to_string(path).map_err(|e| SchemaError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let raw: Value = serde_json::from_str(&contents).map_err(|e| SchemaError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_value(raw)
    }

    /// Content sum of the schema source, for cross-process agreement.
    pub fn sum(&self) -> &str {
        &self.sum
    }

    /// The schema as parsed, for shipping to subscribers.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Validate a candidate value, reporting every violation.
    pub fn check(&self, candidate: &Value) -> Result<(), Vec<SchemaViolation>> {
        let violations: Vec<SchemaViolation> = self
            .validator
            .iter_errors(candidate)
            .map(|err| SchemaViolation {
                field: err.instance_path.to_string(),
                message: err.to_string(),
                constraint: err.schema_path.to_string(),
                value: err.instance.clone().into_owned(),
            })
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Boolean form of [`check`](Self::check).
    pub fn is_valid(&self, candidate: &Value) -> bool {
        self.validator.is_valid(candidate)
    }
}

/// BLAKE3 content sum truncated to 128 bits, over the schema's compact
/// serialization.
pub fn schema_sum(schema: &Value) -> String {
    let bytes = serde_json::to_vec(schema).unwrap_or_default();
    let hash = blake3::hash(&bytes);
    hex::encode(&hash.as_bytes()[..16])
}
