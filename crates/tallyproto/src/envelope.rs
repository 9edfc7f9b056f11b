//! Sync frames and typed errors for the replicant sync protocol.
//!
//! A frame is one message on the (assumed reliable, in-order) channel between
//! an authority and its subscribers. Declarations and proposals carry a
//! correlation id so acks can be matched to their request.

use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-replicant declaration options as they travel on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclareOpts {
    /// Whether the authority keeps the value in its durable store.
    #[serde(default = "default_persistent")]
    pub persistent: bool,

    /// Content sum of the schema the declaring side compiled, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_sum: Option<String>,

    /// Value to seed the replicant with when nothing is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

fn default_persistent() -> bool {
    true
}

impl Default for DeclareOpts {
    fn default() -> Self {
        Self {
            persistent: true,
            schema_sum: None,
            default_value: None,
        }
    }
}

/// Error categories surfaced over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SchemaValidationError,
    CrossOwnershipError,
    UnknownReplicant,
    UndeclaredReplicant,
    InternalError,
}

/// Error envelope for rejected declarations and proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl SyncError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SyncError {}

/// All messages exchanged between an authority and its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncFrame {
    /// Subscriber asks the authority to declare (or look up) a replicant.
    Declare {
        id: Uuid,
        namespace: String,
        name: String,
        opts: DeclareOpts,
    },

    /// Authority's answer: the full current state of the replicant.
    ///
    /// When the subscriber's `schema_sum` differs from the authority's, the
    /// authority includes its schema and the subscriber must adopt it.
    DeclareAck {
        id: Uuid,
        namespace: String,
        name: String,
        value: Option<Value>,
        revision: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema_sum: Option<String>,
    },

    /// One flushed operation batch, authority to subscribers.
    Broadcast {
        namespace: String,
        name: String,
        revision: u64,
        operations: Vec<Operation>,
    },

    /// Subscriber-side mutations proposed to the authority.
    Propose {
        id: Uuid,
        namespace: String,
        name: String,
        operations: Vec<Operation>,
    },

    /// Authority's verdict on a proposal.
    ProposeAck {
        id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SyncError>,
    },

    /// A declaration was rejected outright.
    DeclareNak { id: Uuid, error: SyncError },
}

impl SyncFrame {
    /// The `(namespace, name)` this frame addresses, when it addresses one.
    pub fn target(&self) -> Option<(&str, &str)> {
        match self {
            SyncFrame::Declare { namespace, name, .. }
            | SyncFrame::DeclareAck { namespace, name, .. }
            | SyncFrame::Broadcast { namespace, name, .. }
            | SyncFrame::Propose { namespace, name, .. } => Some((namespace, name)),
            SyncFrame::ProposeAck { .. } | SyncFrame::DeclareNak { .. } => None,
        }
    }
}
