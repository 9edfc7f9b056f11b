//! tallyproto - Protocol types for the tally replicant sync channel
//!
//! This crate defines the messages exchanged between a tally authority and
//! its subscribers. It is transport-agnostic: frames are plain serde types
//! and the carrying channel (websocket, ZMQ, in-process) lives elsewhere.
//!
//! ## Operations
//!
//! Every mutation to a replicant's value tree is described by an
//! [`Operation`]: a path into the tree plus a method (`overwrite`, `add`,
//! `update`, `delete`, or one of the JavaScript-style sequence mutators)
//! and its arguments. Replaying a batch of operations against the pre-batch
//! value reproduces the post-batch value exactly.
//!
//! ## Frames
//!
//! [`SyncFrame`] wraps the declaration handshake, operation broadcasts,
//! subscriber proposals, and their acks. Errors travel as a typed
//! [`SyncError`] envelope.

pub mod envelope;
pub mod operation;
pub mod path;

pub use envelope::{DeclareOpts, ErrorKind, SyncError, SyncFrame};
pub use operation::{OpKind, Operation, SeqMethod, WireError};
