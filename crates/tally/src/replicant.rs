//! The replicant: a named, schema-gated, observable state cell.
//!
//! A `Replicant` is a cheap clonable handle; all state lives behind short
//! `Mutex` sections so listener callbacks can re-enter the mutation API
//! without deadlocking. Mutations validate and enqueue synchronously; the
//! owning [`Replicator`](crate::replicator::Replicator) drains the queue at
//! the end of the turn.

use crate::apply;
use crate::errors::ReplicantError;
use crate::schema::{SchemaGate, SchemaViolation};
use crate::view::{Graft, ValueView};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tallyproto::{path, DeclareOpts, OpKind, Operation, SeqMethod};
use tracing::{debug, warn};

/// Default coalescing window for durable-store writes.
pub const DEFAULT_PERSISTENCE_INTERVAL: Duration = Duration::from_millis(100);

/// Where a replicant sits relative to the authoritative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authority,
    Subscriber,
}

/// Declaration progress. `Declared` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Undeclared,
    Declaring,
    Declared,
}

/// Per-replicant options fixed at declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicantOpts {
    /// Keep the value in the durable store across restarts.
    pub persistent: bool,
    /// Coalescing window for durable-store writes.
    pub persistence_interval: Duration,
    /// Schema source on the authority's disk.
    pub schema_path: Option<PathBuf>,
    /// Seed value used only when nothing is persisted.
    pub default_value: Option<Value>,
}

impl Default for ReplicantOpts {
    fn default() -> Self {
        Self {
            persistent: true,
            persistence_interval: DEFAULT_PERSISTENCE_INTERVAL,
            schema_path: None,
            default_value: None,
        }
    }
}

impl ReplicantOpts {
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_schema_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema_path = Some(path.into());
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.persistent = false;
        self
    }

    /// Why a redeclaration with `other` would conflict, if it would.
    pub(crate) fn conflicts_with(&self, other: &ReplicantOpts) -> Option<String> {
        if self.persistent != other.persistent {
            return Some("persistent flag differs".to_string());
        }
        if self.schema_path != other.schema_path {
            return Some("schema path differs".to_string());
        }
        if self.default_value != other.default_value {
            return Some("default value differs".to_string());
        }
        None
    }

    /// Wire form for the declaration handshake.
    pub(crate) fn to_wire(&self, schema_sum: Option<String>) -> DeclareOpts {
        DeclareOpts {
            persistent: self.persistent,
            schema_sum,
            default_value: self.default_value.clone(),
        }
    }
}

/// Identifier handed out by `on_change`/`once_change`, usable with
/// `off_change`.
pub type ListenerId = u64;

type ChangeFn = dyn Fn(Option<&Value>, Option<&Value>, &[Operation]) + Send + Sync;

struct Listener {
    id: ListenerId,
    once: bool,
    callback: Arc<ChangeFn>,
}

/// One flushed batch, handed to the replicator for broadcast and emission.
pub(crate) struct FlushBatch {
    pub operations: Vec<Operation>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub revision: u64,
}

struct State {
    status: Status,
    value: Option<Value>,
    revision: u64,
    schema: Option<Arc<SchemaGate>>,
    validation_errors: Vec<SchemaViolation>,
    queue: Vec<Operation>,
    pending_flush: bool,
    turn_start: Option<Option<Value>>,
    suspended: bool,
    /// Broadcasts that arrived while still `Declaring`.
    inbound_backlog: Vec<(u64, Vec<Operation>)>,
}

pub(crate) struct Shared {
    namespace: String,
    name: String,
    role: Role,
    opts: ReplicantOpts,
    queue_warn_depth: usize,
    state: Mutex<State>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    dirty_tx: Mutex<Option<Sender<(String, String)>>>,
}

/// A named, namespaced, schema-gated, observable value.
#[derive(Clone)]
pub struct Replicant {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Replicant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicant")
            .field("ident", &self.ident())
            .field("revision", &self.revision())
            .field("status", &self.status())
            .finish()
    }
}

/// Suspends interception for one replicant; resumes on drop, including on
/// early returns and unwinds.
pub(crate) struct SuspendGuard {
    shared: Arc<Shared>,
}

impl SuspendGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.state.lock().unwrap().suspended = true;
        Self { shared }
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.suspended = false;
        }
    }
}

impl Replicant {
    pub(crate) fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        role: Role,
        opts: ReplicantOpts,
        queue_warn_depth: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                namespace: namespace.into(),
                name: name.into(),
                role,
                opts,
                queue_warn_depth,
                state: Mutex::new(State {
                    status: Status::Undeclared,
                    value: None,
                    revision: 0,
                    schema: None,
                    validation_errors: Vec::new(),
                    queue: Vec::new(),
                    pending_flush: false,
                    turn_start: None,
                    suspended: false,
                    inbound_backlog: Vec::new(),
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                dirty_tx: Mutex::new(None),
            }),
        }
    }

    // === Identity & inspection ===

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// `namespace/name`, for logs and error reports.
    pub fn ident(&self) -> String {
        format!("{}/{}", self.shared.namespace, self.shared.name)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn opts(&self) -> ReplicantOpts {
        self.shared.opts.clone()
    }

    pub fn status(&self) -> Status {
        self.shared.state.lock().unwrap().status
    }

    pub fn revision(&self) -> u64 {
        self.shared.state.lock().unwrap().revision
    }

    /// Clone of the current value tree; `None` while undefined.
    pub fn value(&self) -> Option<Value> {
        self.shared.state.lock().unwrap().value.clone()
    }

    /// Clone of the subtree at `target`, if it resolves.
    pub fn get(&self, target: &str) -> Option<Value> {
        let state = self.shared.state.lock().unwrap();
        let root = state.value.as_ref()?;
        apply::resolve(root, target).cloned()
    }

    /// A view handle rooted at `/`.
    pub fn root(&self) -> ValueView {
        ValueView::new(self.clone(), path::ROOT.to_string())
    }

    /// A view handle at an arbitrary path.
    pub fn at(&self, target: &str) -> ValueView {
        ValueView::new(self.clone(), target.to_string())
    }

    pub fn schema_sum(&self) -> Option<String> {
        let state = self.shared.state.lock().unwrap();
        state.schema.as_ref().map(|gate| gate.sum().to_string())
    }

    pub(crate) fn schema(&self) -> Option<Arc<SchemaGate>> {
        self.shared.state.lock().unwrap().schema.clone()
    }

    /// Violations recorded by the most recent failed validation.
    pub fn validation_errors(&self) -> Vec<SchemaViolation> {
        self.shared.state.lock().unwrap().validation_errors.clone()
    }

    pub(crate) fn same_as(&self, other: &Replicant) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // === Mutation API ===

    /// Replace the whole value tree.
    pub fn replace(&self, value: impl Into<Graft>) -> Result<(), ReplicantError> {
        let incoming = self.admit(path::ROOT, value.into())?;
        let mut state = self.shared.state.lock().unwrap();
        if state.suspended {
            state.value = Some(incoming);
            return Ok(());
        }
        self.require_declared(&state)?;

        let op = Operation::overwrite(incoming.clone());
        self.gate_check(&mut state, &op)?;
        self.enqueue(&mut state, op);
        if self.shared.role == Role::Authority {
            state.value = Some(incoming);
        }
        Ok(())
    }

    /// Assign the member addressed by `target` (`add` when it does not exist
    /// yet, `update` when it does). Assigning a primitive strictly equal to
    /// the current one is a no-op.
    pub fn set(&self, target: &str, value: impl Into<Graft>) -> Result<(), ReplicantError> {
        let incoming = self.admit(target, value.into())?;
        let (container_path, prop) =
            path::split_last(target).ok_or_else(|| ReplicantError::InvalidPath {
                path: target.to_string(),
                reason: "the root is assigned with replace()".to_string(),
            })?;

        let mut state = self.shared.state.lock().unwrap();
        if state.suspended {
            let op = Operation::update(&container_path, prop.as_str(), incoming);
            return apply::apply_to_tree(&mut state.value, &op).map(|_| ());
        }
        self.require_declared(&state)?;

        let container = state
            .value
            .as_ref()
            .and_then(|root| apply::resolve(root, &container_path))
            .ok_or_else(|| ReplicantError::InvalidPath {
                path: target.to_string(),
                reason: format!("no container at {}", container_path),
            })?;
        match container {
            Value::Object(_) => {}
            Value::Array(_) => {
                if prop.parse::<usize>().is_err() {
                    return Err(ReplicantError::InvalidPath {
                        path: target.to_string(),
                        reason: format!("{:?} is not a sequence index", prop),
                    });
                }
            }
            _ => {
                return Err(ReplicantError::InvalidPath {
                    path: target.to_string(),
                    reason: format!("{} is not a container", container_path),
                })
            }
        }
        let existing = apply::get_member(container, &prop).cloned();

        if let Some(existing) = &existing {
            if is_primitive(existing) && is_primitive(&incoming) && *existing == incoming {
                return Ok(());
            }
        }

        let op = if existing.is_some() {
            Operation::update(&container_path, prop.as_str(), incoming)
        } else {
            Operation::add(&container_path, prop.as_str(), incoming)
        };
        self.gate_check(&mut state, &op)?;
        self.enqueue(&mut state, op.clone());
        if self.shared.role == Role::Authority {
            apply::apply_to_tree(&mut state.value, &op)?;
        }
        Ok(())
    }

    /// Remove the member addressed by `target`. Succeeds trivially when the
    /// member is already absent.
    pub fn delete(&self, target: &str) -> Result<(), ReplicantError> {
        let (container_path, prop) =
            path::split_last(target).ok_or_else(|| ReplicantError::InvalidPath {
                path: target.to_string(),
                reason: "cannot delete the root".to_string(),
            })?;

        let mut state = self.shared.state.lock().unwrap();
        if state.suspended {
            let op = Operation::delete(&container_path, prop.as_str());
            return apply::apply_to_tree(&mut state.value, &op).map(|_| ());
        }
        self.require_declared(&state)?;

        let exists = state
            .value
            .as_ref()
            .and_then(|root| apply::resolve(root, &container_path))
            .and_then(|container| apply::get_member(container, &prop))
            .is_some();
        if !exists {
            return Ok(());
        }

        let op = Operation::delete(&container_path, prop.as_str());
        self.gate_check(&mut state, &op)?;
        self.enqueue(&mut state, op.clone());
        if self.shared.role == Role::Authority {
            apply::apply_to_tree(&mut state.value, &op)?;
        }
        Ok(())
    }

    /// Invoke a sequence mutator on the sequence at `target` with the
    /// literal arguments. On the authority this returns what the JavaScript
    /// call would return; on a subscriber the local sequence is left alone
    /// and the authoritative echo supplies the state.
    pub fn mutate(
        &self,
        target: &str,
        method: SeqMethod,
        args: Vec<Value>,
    ) -> Result<Option<Value>, ReplicantError> {
        let mut state = self.shared.state.lock().unwrap();
        let op = Operation::sequence(target, method, args);
        if state.suspended {
            return apply::apply_to_tree(&mut state.value, &op);
        }
        self.require_declared(&state)?;

        let is_sequence = state
            .value
            .as_ref()
            .and_then(|root| apply::resolve(root, target))
            .map(Value::is_array)
            .unwrap_or(false);
        if !is_sequence {
            return Err(ReplicantError::InvalidPath {
                path: target.to_string(),
                reason: format!("{} requires a sequence", method),
            });
        }

        self.gate_check(&mut state, &op)?;
        self.enqueue(&mut state, op.clone());
        if self.shared.role == Role::Authority {
            apply::apply_to_tree(&mut state.value, &op)
        } else {
            Ok(None)
        }
    }

    // === Change listeners ===

    /// Register a change listener. While `Declared`, the listener fires
    /// synchronously right away with the current value and no old value or
    /// operations.
    pub fn on_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(Option<&Value>, Option<&Value>, &[Operation]) + Send + Sync + 'static,
    {
        self.register(callback, false)
    }

    /// Register a one-shot change listener. While `Declared` it fires
    /// immediately with the current value and is consumed — it will not fire
    /// again on the next real change.
    pub fn once_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(Option<&Value>, Option<&Value>, &[Operation]) + Send + Sync + 'static,
    {
        self.register(callback, true)
    }

    fn register<F>(&self, callback: F, once: bool) -> ListenerId
    where
        F: Fn(Option<&Value>, Option<&Value>, &[Operation]) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        let callback: Arc<ChangeFn> = Arc::new(callback);

        let declared = self.status() == Status::Declared;
        if declared {
            let current = self.value();
            callback(current.as_ref(), None, &[]);
            if once {
                return id;
            }
        }

        self.shared.listeners.lock().unwrap().push(Listener {
            id,
            once,
            callback,
        });
        id
    }

    /// Remove a listener. Returns whether it was still registered.
    pub fn off_change(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    // === Validation ===

    /// Validate `candidate` (or the current value) against the schema,
    /// recording violations on failure.
    pub fn validate(&self, candidate: Option<&Value>) -> Result<(), ReplicantError> {
        match self.run_validation(candidate) {
            None => Ok(()),
            Some(violations) => Err(ReplicantError::SchemaValidation {
                namespace: self.shared.namespace.clone(),
                name: self.shared.name.clone(),
                violations,
            }),
        }
    }

    /// Boolean form of [`validate`](Self::validate); still records
    /// violations, never touches the value.
    pub fn is_valid(&self, candidate: Option<&Value>) -> bool {
        self.run_validation(candidate).is_none()
    }

    fn run_validation(&self, candidate: Option<&Value>) -> Option<Vec<SchemaViolation>> {
        let (gate, value) = {
            let state = self.shared.state.lock().unwrap();
            (
                state.schema.clone()?,
                candidate.cloned().or_else(|| state.value.clone())?,
            )
        };
        match gate.check(&value) {
            Ok(()) => None,
            Err(violations) => {
                self.shared.state.lock().unwrap().validation_errors = violations.clone();
                Some(violations)
            }
        }
    }

    // === Lifecycle, driven by the Replicator ===

    pub(crate) fn attach_dirty(&self, tx: Sender<(String, String)>) {
        *self.shared.dirty_tx.lock().unwrap() = Some(tx);
    }

    pub(crate) fn begin_declaring(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.status == Status::Undeclared {
            state.status = Status::Declaring;
        }
    }

    /// Complete declaration with the initial state, then drain any
    /// broadcasts that arrived while declaring.
    pub(crate) fn complete_declaration(
        &self,
        value: Option<Value>,
        revision: u64,
        schema: Option<Arc<SchemaGate>>,
    ) {
        let backlog = {
            let mut state = self.shared.state.lock().unwrap();
            state.value = value;
            state.revision = revision;
            if schema.is_some() {
                state.schema = schema;
            }
            state.status = Status::Declared;
            std::mem::take(&mut state.inbound_backlog)
        };
        debug!(replicant = %self.ident(), revision, "declared");

        let current = self.value();
        self.emit_change(current.as_ref(), None, &[]);

        for (revision, operations) in backlog {
            if let Err(e) = self.apply_remote(revision, &operations) {
                warn!(replicant = %self.ident(), error = %e, "failed to drain queued operations");
            }
        }
    }

    pub(crate) fn set_schema(&self, schema: Option<Arc<SchemaGate>>) {
        self.shared.state.lock().unwrap().schema = schema;
    }

    /// Apply one authoritative batch (or one proposal, on the authority's
    /// side the caller goes through the validated mutation API instead).
    /// Interception stays suspended for the whole batch.
    pub(crate) fn apply_remote(
        &self,
        revision: u64,
        operations: &[Operation],
    ) -> Result<(), ReplicantError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            match state.status {
                Status::Declared => {}
                Status::Declaring => {
                    state.inbound_backlog.push((revision, operations.to_vec()));
                    return Ok(());
                }
                Status::Undeclared => {
                    return Err(ReplicantError::Undeclared {
                        namespace: self.shared.namespace.clone(),
                        name: self.shared.name.clone(),
                    })
                }
            }
        }

        let _suspend = SuspendGuard::new(self.shared.clone());
        let (old, new) = {
            let mut state = self.shared.state.lock().unwrap();
            let old = state.value.clone();
            for op in operations {
                apply::apply_to_tree(&mut state.value, op)?;
            }
            state.revision = revision;
            (old, state.value.clone())
        };

        self.emit_change(new.as_ref(), old.as_ref(), operations);
        Ok(())
    }

    /// Accept a subscriber's proposed batch on the authority: validate the
    /// whole batch against a clone, then apply it and enqueue the operations
    /// so they rebroadcast through the normal flush cycle. All-or-nothing —
    /// a failing batch changes nothing.
    pub(crate) fn ingest_proposal(&self, operations: &[Operation]) -> Result<(), ReplicantError> {
        let mut state = self.shared.state.lock().unwrap();
        self.require_declared(&state)?;

        let mut clone = state.value.clone();
        for op in operations {
            apply::apply_to_tree(&mut clone, op)?;
        }
        if let (Some(gate), Some(candidate)) = (state.schema.clone(), clone.as_ref()) {
            if let Err(violations) = gate.check(candidate) {
                state.validation_errors = violations.clone();
                return Err(ReplicantError::SchemaValidation {
                    namespace: self.shared.namespace.clone(),
                    name: self.shared.name.clone(),
                    violations,
                });
            }
        }

        for op in operations {
            self.enqueue(&mut state, op.clone());
        }
        state.value = clone;
        Ok(())
    }

    /// Drain the queue for this turn. `None` when there is nothing to flush.
    pub(crate) fn take_batch(&self) -> Option<FlushBatch> {
        let mut state = self.shared.state.lock().unwrap();
        if state.queue.is_empty() {
            state.pending_flush = false;
            state.turn_start = None;
            return None;
        }
        let operations = std::mem::take(&mut state.queue);
        let old_value = state.turn_start.take().flatten();
        state.pending_flush = false;
        if self.shared.role == Role::Authority {
            state.revision += 1;
        }
        Some(FlushBatch {
            operations,
            old_value,
            new_value: state.value.clone(),
            revision: state.revision,
        })
    }

    pub(crate) fn emit_change(
        &self,
        new: Option<&Value>,
        old: Option<&Value>,
        operations: &[Operation],
    ) {
        let callbacks: Vec<Arc<ChangeFn>> = {
            let mut listeners = self.shared.listeners.lock().unwrap();
            let snapshot = listeners.iter().map(|l| l.callback.clone()).collect();
            listeners.retain(|l| !l.once);
            snapshot
        };
        for callback in callbacks {
            callback(new, old, operations);
        }
    }

    // === Internals ===

    fn require_declared(&self, state: &State) -> Result<(), ReplicantError> {
        if state.status == Status::Declared {
            Ok(())
        } else {
            Err(ReplicantError::Undeclared {
                namespace: self.shared.namespace.clone(),
                name: self.shared.name.clone(),
            })
        }
    }

    /// Resolve a graft into a plain value, enforcing single ownership.
    fn admit(&self, target: &str, graft: Graft) -> Result<Value, ReplicantError> {
        match graft {
            Graft::Plain(value) => Ok(value),
            Graft::View(view) => {
                let value = view.get().unwrap_or(Value::Null);
                if view.owner().same_as(self) {
                    Ok(value)
                } else {
                    Err(ReplicantError::CrossOwnership {
                        owner: view.owner().ident(),
                        target: self.ident(),
                        path: target.to_string(),
                        value,
                    })
                }
            }
        }
    }

    /// Dry-run `prospective` against a clone and validate the result.
    fn gate_check(
        &self,
        state: &mut State,
        prospective: &Operation,
    ) -> Result<(), ReplicantError> {
        let gate = match &state.schema {
            Some(gate) => gate.clone(),
            None => return Ok(()),
        };
        let mut clone = state.value.clone();
        apply::apply_to_tree(&mut clone, prospective)?;
        if let Some(candidate) = clone {
            if let Err(violations) = gate.check(&candidate) {
                state.validation_errors = violations.clone();
                return Err(ReplicantError::SchemaValidation {
                    namespace: self.shared.namespace.clone(),
                    name: self.shared.name.clone(),
                    violations,
                });
            }
        }
        Ok(())
    }

    fn enqueue(&self, state: &mut State, op: Operation) {
        if let OpKind::Overwrite { .. } = op.kind {
            // Everything under the overwritten subtree is now redundant and
            // may reference paths that no longer exist.
            state.queue.retain(|queued| !path::is_within(&queued.path, &op.path));
        }
        if !state.pending_flush {
            state.pending_flush = true;
            state.turn_start = Some(state.value.clone());
            if let Some(tx) = self.shared.dirty_tx.lock().unwrap().as_ref() {
                let _ = tx.send((self.shared.namespace.clone(), self.shared.name.clone()));
            }
        }
        state.queue.push(op);
        if state.queue.len() == self.shared.queue_warn_depth {
            warn!(
                replicant = %self.ident(),
                depth = state.queue.len(),
                "operation queue is unusually deep for a single turn"
            );
        }
    }
}

fn is_primitive(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}
