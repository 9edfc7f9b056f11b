//! Tally - replicated state for live broadcast tooling
//!
//! The central abstraction is the [`Replicant`]: a named, namespaced,
//! schema-gated, observable JSON value. Mutations made through the path API
//! (or a [`ValueView`] handle) are captured as [`Operation`]s, validated
//! against the replicant's schema, applied, and flushed at the end of the
//! turn as one ordered, revisioned batch — broadcast to subscribers and
//! delivered to local change listeners.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tally::{link::NullLink, ReplicantOpts, Replicator};
//!
//! let replicator = Replicator::authority(Arc::new(NullLink));
//! let r = replicator
//!     .find_or_declare(
//!         "bundle",
//!         "state",
//!         ReplicantOpts::default().with_default(json!({"a": {"b": [1, 2]}})),
//!     )
//!     .unwrap();
//!
//! r.set("/a/b/1", json!(9)).unwrap();
//! replicator.flush_pending(); // revision 0 -> 1, one change event
//! assert_eq!(r.get("/a/b"), Some(json!([1, 9])));
//! ```

pub mod apply;
pub mod errors;
pub mod link;
pub mod mutators;
pub mod persistence;
pub mod replicant;
pub mod replicator;
pub mod schema;
pub mod telemetry;
pub mod view;

pub use errors::ReplicantError;
pub use link::{ChannelLink, NullLink, SyncLink};
pub use persistence::{Persistor, ReplicantStore};
pub use replicant::{ListenerId, Replicant, ReplicantOpts, Role, Status};
pub use replicator::{Replicator, ReplicatorTuning};
pub use schema::{SchemaGate, SchemaViolation};
pub use view::{Graft, ValueView};

pub use tallyproto::{OpKind, Operation, SeqMethod, SyncFrame};
