//! The replicator: registry and dispatcher for a set of replicants.
//!
//! One replicator per process side. The authority owns the durable store and
//! the revision counter; subscribers propose mutations and accept whatever
//! the authority echoes back. `flush_pending` is the end-of-turn hook — the
//! host loop calls it after each burst of synchronous work, which is what
//! turns queued operations into broadcasts and change notifications.

use crate::errors::ReplicantError;
use crate::link::SyncLink;
use crate::persistence::{Persistor, ReplicantStore};
use crate::replicant::{Replicant, ReplicantOpts, Role};
use crate::schema::SchemaGate;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tallyproto::{Operation, SyncFrame, WireError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounds and defaults for one replicator.
#[derive(Debug, Clone)]
pub struct ReplicatorTuning {
    /// Frames held for a replicant not yet known on this side; oldest are
    /// dropped past the cap.
    pub predeclare_cap: usize,
    /// Queue depth at which a single turn logs a warning.
    pub queue_warn_depth: usize,
    /// Persistence window applied to replicants declared over the wire
    /// (local declarations carry their own).
    pub default_persistence_interval: Duration,
}

impl Default for ReplicatorTuning {
    fn default() -> Self {
        Self {
            predeclare_cap: 1024,
            queue_warn_depth: 8192,
            default_persistence_interval: crate::replicant::DEFAULT_PERSISTENCE_INTERVAL,
        }
    }
}

type Key = (String, String);

struct Inner {
    role: Role,
    link: Arc<dyn SyncLink>,
    store: Option<ReplicantStore>,
    persistor: Option<Arc<Persistor>>,
    tuning: ReplicatorTuning,
    registry: Mutex<HashMap<Key, Replicant>>,
    /// Frames that arrived before their replicant existed here.
    orphans: Mutex<HashMap<Key, VecDeque<SyncFrame>>>,
    dirty_tx: Sender<Key>,
    dirty_rx: Mutex<Receiver<Key>>,
}

/// Registry and dispatcher for one side of the sync channel.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<Inner>,
}

impl Replicator {
    /// An authority with no durable store (everything is ephemeral).
    pub fn authority(link: Arc<dyn SyncLink>) -> Self {
        Self::build(Role::Authority, link, None, ReplicatorTuning::default())
    }

    /// An authority backed by a durable store.
    pub fn authority_with_store(link: Arc<dyn SyncLink>, store: ReplicantStore) -> Self {
        Self::build(Role::Authority, link, Some(store), ReplicatorTuning::default())
    }

    /// A subscriber mirroring some remote authority.
    pub fn subscriber(link: Arc<dyn SyncLink>) -> Self {
        Self::build(Role::Subscriber, link, None, ReplicatorTuning::default())
    }

    pub fn with_tuning(mut self, tuning: ReplicatorTuning) -> Self {
        // Tuning only matters before any replicant is declared.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.tuning = tuning;
        }
        self
    }

    fn build(
        role: Role,
        link: Arc<dyn SyncLink>,
        store: Option<ReplicantStore>,
        tuning: ReplicatorTuning,
    ) -> Self {
        let (dirty_tx, dirty_rx) = channel();
        let persistor = store
            .as_ref()
            .map(|store| Arc::new(Persistor::new(store.clone())));
        Self {
            inner: Arc::new(Inner {
                role,
                link,
                store,
                persistor,
                tuning,
                registry: Mutex::new(HashMap::new()),
                orphans: Mutex::new(HashMap::new()),
                dirty_tx,
                dirty_rx: Mutex::new(dirty_rx),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// The debouncer in front of the durable store, when one is configured.
    pub fn persistor(&self) -> Option<Arc<Persistor>> {
        self.inner.persistor.clone()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Replicant> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Return the existing replicant for `(namespace, name)` or construct
    /// and declare one. Calling twice with the same options returns the same
    /// instance and does not disturb its revision; conflicting options are
    /// rejected.
    pub fn find_or_declare(
        &self,
        namespace: &str,
        name: &str,
        opts: ReplicantOpts,
    ) -> Result<Replicant, ReplicantError> {
        if namespace.is_empty() || name.is_empty() {
            return Err(ReplicantError::InvalidDeclaration {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: "namespace and name must be non-empty".to_string(),
            });
        }

        let key = (namespace.to_string(), name.to_string());
        let replicant = {
            let mut registry = self.inner.registry.lock().unwrap();
            if let Some(existing) = registry.get(&key) {
                if let Some(reason) = existing.opts().conflicts_with(&opts) {
                    return Err(ReplicantError::InvalidDeclaration {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        reason,
                    });
                }
                return Ok(existing.clone());
            }
            let replicant = Replicant::new(
                namespace,
                name,
                self.inner.role,
                opts,
                self.inner.tuning.queue_warn_depth,
            );
            replicant.attach_dirty(self.inner.dirty_tx.clone());
            registry.insert(key.clone(), replicant.clone());
            replicant
        };

        replicant.begin_declaring();
        match self.inner.role {
            Role::Authority => self.declare_locally(&replicant)?,
            Role::Subscriber => self.declare_remotely(&replicant)?,
        }
        self.drain_orphans(&key);
        Ok(replicant)
    }

    /// Authority-side declaration: resolve the initial value from the store,
    /// the default, or nothing, gate it through the schema, go `Declared`.
    fn declare_locally(&self, replicant: &Replicant) -> Result<(), ReplicantError> {
        let opts = replicant.opts();
        let schema = match &opts.schema_path {
            Some(path) => Some(Arc::new(SchemaGate::from_path(path)?)),
            None => None,
        };

        let persisted = if opts.persistent {
            match &self.inner.store {
                Some(store) => store.read(replicant.namespace(), replicant.name())?,
                None => None,
            }
        } else {
            None
        };

        let initial = match persisted {
            Some(value) => {
                let rejected = schema
                    .as_ref()
                    .map(|gate| !gate.is_valid(&value))
                    .unwrap_or(false);
                if rejected {
                    warn!(
                        replicant = %replicant.ident(),
                        "persisted value fails the schema, falling back to the default"
                    );
                    opts.default_value.clone()
                } else {
                    Some(value)
                }
            }
            None => opts.default_value.clone(),
        };

        info!(replicant = %replicant.ident(), persisted = initial.is_some(), "declared");
        replicant.complete_declaration(initial, 0, schema);
        Ok(())
    }

    /// Subscriber-side declaration: compile any local schema, then ask the
    /// authority. `Declared` arrives with the ack.
    fn declare_remotely(&self, replicant: &Replicant) -> Result<(), ReplicantError> {
        let opts = replicant.opts();
        let schema = match &opts.schema_path {
            Some(path) => Some(Arc::new(SchemaGate::from_path(path)?)),
            None => None,
        };
        let schema_sum = schema.as_ref().map(|gate| gate.sum().to_string());
        replicant.set_schema(schema);

        self.inner.link.publish(SyncFrame::Declare {
            id: Uuid::new_v4(),
            namespace: replicant.namespace().to_string(),
            name: replicant.name().to_string(),
            opts: opts.to_wire(schema_sum),
        });
        Ok(())
    }

    /// Drain every replicant that accumulated operations this turn.
    ///
    /// Mutations performed by change listeners during this call re-dirty
    /// their replicant and are picked up by the *next* call, never this one.
    pub fn flush_pending(&self) {
        let dirty: Vec<Key> = {
            let rx = self.inner.dirty_rx.lock().unwrap();
            rx.try_iter().collect()
        };
        for key in dirty {
            if let Some(replicant) = self.get(&key.0, &key.1) {
                self.flush_one(&replicant);
            }
        }
    }

    fn flush_one(&self, replicant: &Replicant) {
        let Some(batch) = replicant.take_batch() else {
            return;
        };
        debug!(
            replicant = %replicant.ident(),
            revision = batch.revision,
            operations = batch.operations.len(),
            "flush"
        );

        match self.inner.role {
            Role::Authority => {
                self.inner.link.publish(SyncFrame::Broadcast {
                    namespace: replicant.namespace().to_string(),
                    name: replicant.name().to_string(),
                    revision: batch.revision,
                    operations: batch.operations.clone(),
                });
                let opts = replicant.opts();
                if opts.persistent {
                    if let Some(persistor) = &self.inner.persistor {
                        persistor.schedule(
                            replicant.namespace(),
                            replicant.name(),
                            batch.new_value.clone(),
                            opts.persistence_interval,
                        );
                    }
                }
                replicant.emit_change(
                    batch.new_value.as_ref(),
                    batch.old_value.as_ref(),
                    &batch.operations,
                );
            }
            Role::Subscriber => {
                // Change emission waits for the authoritative echo.
                self.inner.link.publish(SyncFrame::Propose {
                    id: Uuid::new_v4(),
                    namespace: replicant.namespace().to_string(),
                    name: replicant.name().to_string(),
                    operations: batch.operations,
                });
            }
        }
    }

    /// Decode and dispatch a frame from the raw wire. Unknown operation
    /// methods are surfaced as their own error so the edge can treat them as
    /// fatal.
    pub fn receive_json(&self, raw: &str) -> Result<(), ReplicantError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ReplicantError::MalformedFrame {
                message: e.to_string(),
            })?;
        if let Some(operations) = value.get("operations").and_then(Value::as_array) {
            for op in operations {
                if let Err(e) = Operation::from_wire(op) {
                    return Err(match e {
                        WireError::UnknownMethod { method } => {
                            ReplicantError::UnknownOperationMethod { method }
                        }
                        WireError::Malformed(message) => ReplicantError::MalformedFrame { message },
                    });
                }
            }
        }
        let frame: SyncFrame =
            serde_json::from_value(value).map_err(|e| ReplicantError::MalformedFrame {
                message: e.to_string(),
            })?;
        self.receive(frame)
    }

    /// Dispatch one inbound frame.
    pub fn receive(&self, frame: SyncFrame) -> Result<(), ReplicantError> {
        match (self.inner.role, frame) {
            (
                Role::Authority,
                SyncFrame::Declare {
                    id,
                    namespace,
                    name,
                    opts,
                },
            ) => {
                let local_opts = ReplicantOpts {
                    persistent: opts.persistent,
                    default_value: opts.default_value.clone(),
                    persistence_interval: self.inner.tuning.default_persistence_interval,
                    ..ReplicantOpts::default()
                };
                let replicant = match self.get(&namespace, &name) {
                    Some(existing) => existing,
                    None => match self.find_or_declare(&namespace, &name, local_opts) {
                        Ok(replicant) => replicant,
                        Err(e) => {
                            self.inner.link.publish(SyncFrame::DeclareNak {
                                id,
                                error: e.to_sync_error(),
                            });
                            return Ok(());
                        }
                    },
                };

                let our_sum = replicant.schema_sum();
                let ship_schema = our_sum.is_some() && our_sum != opts.schema_sum;
                self.inner.link.publish(SyncFrame::DeclareAck {
                    id,
                    namespace,
                    name,
                    value: replicant.value(),
                    revision: replicant.revision(),
                    schema: if ship_schema {
                        replicant.schema().map(|gate| gate.raw().clone())
                    } else {
                        None
                    },
                    schema_sum: our_sum,
                });
                Ok(())
            }

            (
                Role::Authority,
                SyncFrame::Propose {
                    id,
                    namespace,
                    name,
                    operations,
                },
            ) => {
                let Some(replicant) = self.get(&namespace, &name) else {
                    self.buffer_orphan(
                        (namespace.clone(), name.clone()),
                        SyncFrame::Propose {
                            id,
                            namespace,
                            name,
                            operations,
                        },
                    );
                    return Ok(());
                };
                let verdict = replicant.ingest_proposal(&operations);
                self.inner.link.publish(SyncFrame::ProposeAck {
                    id,
                    error: verdict.as_ref().err().map(|e| e.to_sync_error()),
                });
                verdict
            }

            (
                Role::Subscriber,
                SyncFrame::DeclareAck {
                    namespace,
                    name,
                    value,
                    revision,
                    schema,
                    schema_sum,
                    ..
                },
            ) => {
                let Some(replicant) = self.get(&namespace, &name) else {
                    return Err(ReplicantError::UnknownReplicant { namespace, name });
                };
                let adopted = match (schema, &schema_sum) {
                    (Some(raw), Some(sum)) if replicant.schema_sum().as_ref() != Some(sum) => {
                        Some(Arc::new(SchemaGate::from_value(raw)?))
                    }
                    _ => None,
                };
                replicant.complete_declaration(value, revision, adopted);
                Ok(())
            }

            (
                Role::Subscriber,
                SyncFrame::Broadcast {
                    namespace,
                    name,
                    revision,
                    operations,
                },
            ) => {
                let Some(replicant) = self.get(&namespace, &name) else {
                    self.buffer_orphan(
                        (namespace.clone(), name.clone()),
                        SyncFrame::Broadcast {
                            namespace,
                            name,
                            revision,
                            operations,
                        },
                    );
                    return Ok(());
                };
                replicant.apply_remote(revision, &operations)
            }

            (Role::Subscriber, SyncFrame::ProposeAck { id, error }) => {
                if let Some(error) = error {
                    warn!(%id, %error, "proposal rejected by the authority");
                }
                Ok(())
            }

            (Role::Subscriber, SyncFrame::DeclareNak { id, error }) => {
                warn!(%id, %error, "declaration rejected by the authority");
                Ok(())
            }

            (role, frame) => {
                debug!(?role, ?frame, "ignoring frame not meant for this side");
                Ok(())
            }
        }
    }

    fn buffer_orphan(&self, key: Key, frame: SyncFrame) {
        let mut orphans = self.inner.orphans.lock().unwrap();
        let queue = orphans.entry(key.clone()).or_default();
        if queue.len() >= self.inner.tuning.predeclare_cap {
            queue.pop_front();
            warn!(
                replicant = %format!("{}/{}", key.0, key.1),
                "pre-declaration buffer full, dropping oldest frame"
            );
        }
        queue.push_back(frame);
    }

    fn drain_orphans(&self, key: &Key) {
        let frames = {
            let mut orphans = self.inner.orphans.lock().unwrap();
            orphans.remove(key).unwrap_or_default()
        };
        for frame in frames {
            if let Err(e) = self.receive(frame) {
                warn!(
                    replicant = %format!("{}/{}", key.0, key.1),
                    error = %e,
                    "failed to replay buffered frame"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{ChannelLink, NullLink};
    use crate::replicant::Status;
    use serde_json::json;

    fn authority() -> Replicator {
        Replicator::authority(Arc::new(NullLink))
    }

    #[test]
    fn declare_is_idempotent() {
        let replicator = authority();
        let opts = ReplicantOpts::default().with_default(json!({"n": 0}));
        let a = replicator
            .find_or_declare("bundle", "state", opts.clone())
            .unwrap();
        a.set("/n", json!(1)).unwrap();
        replicator.flush_pending();

        let b = replicator.find_or_declare("bundle", "state", opts).unwrap();
        assert!(a.same_as(&b));
        assert_eq!(b.revision(), 1);
    }

    #[test]
    fn conflicting_redeclaration_is_rejected() {
        let replicator = authority();
        replicator
            .find_or_declare("bundle", "state", ReplicantOpts::default())
            .unwrap();
        let err = replicator
            .find_or_declare(
                "bundle",
                "state",
                ReplicantOpts::default().with_default(json!(1)),
            )
            .unwrap_err();
        assert!(matches!(err, ReplicantError::InvalidDeclaration { .. }));
    }

    #[test]
    fn empty_identity_is_rejected() {
        let replicator = authority();
        let err = replicator
            .find_or_declare("", "state", ReplicantOpts::default())
            .unwrap_err();
        assert!(matches!(err, ReplicantError::InvalidDeclaration { .. }));
    }

    #[test]
    fn flush_broadcasts_batch_with_revision() {
        let (link, rx) = ChannelLink::pair();
        let replicator = Replicator::authority(link);
        let r = replicator
            .find_or_declare(
                "bundle",
                "state",
                ReplicantOpts::default().with_default(json!({"xs": [1, 2, 3]})),
            )
            .unwrap();

        r.mutate("/xs", tallyproto::SeqMethod::Push, vec![json!(4), json!(5)])
            .unwrap();
        replicator.flush_pending();

        let frames: Vec<SyncFrame> = rx.try_iter().collect();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            SyncFrame::Broadcast {
                revision,
                operations,
                ..
            } => {
                assert_eq!(*revision, 1);
                assert_eq!(
                    operations[0],
                    Operation::sequence("/xs", tallyproto::SeqMethod::Push, vec![json!(4), json!(5)])
                );
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
        assert_eq!(r.get("/xs"), Some(json!([1, 2, 3, 4, 5])));
    }

    #[test]
    fn empty_turn_broadcasts_nothing() {
        let (link, rx) = ChannelLink::pair();
        let replicator = Replicator::authority(link);
        replicator
            .find_or_declare("bundle", "state", ReplicantOpts::default())
            .unwrap();
        replicator.flush_pending();
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn persisted_value_wins_over_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReplicantStore::open(dir.path()).unwrap();
        store
            .write("bundle", "state", &Some(json!({"n": 42})))
            .unwrap();

        let replicator = Replicator::authority_with_store(Arc::new(NullLink), store);
        let r = replicator
            .find_or_declare(
                "bundle",
                "state",
                ReplicantOpts::default().with_default(json!({"n": 0})),
            )
            .unwrap();
        assert_eq!(r.value(), Some(json!({"n": 42})));
        assert_eq!(r.revision(), 0);
    }

    #[test]
    fn invalid_persisted_value_is_discarded_for_default() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("schema.json");
        std::fs::write(
            &schema_path,
            serde_json::to_vec(&json!({
                "type": "object",
                "properties": {"n": {"type": "number"}},
                "required": ["n"]
            }))
            .unwrap(),
        )
        .unwrap();

        let store = ReplicantStore::open(dir.path()).unwrap();
        store
            .write("bundle", "state", &Some(json!({"n": "corrupt"})))
            .unwrap();

        let replicator = Replicator::authority_with_store(Arc::new(NullLink), store);
        let r = replicator
            .find_or_declare(
                "bundle",
                "state",
                ReplicantOpts::default()
                    .with_default(json!({"n": 0}))
                    .with_schema_path(&schema_path),
            )
            .unwrap();
        assert_eq!(r.value(), Some(json!({"n": 0})));
    }

    #[test]
    fn flush_schedules_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReplicantStore::open(dir.path()).unwrap();
        let replicator = Replicator::authority_with_store(Arc::new(NullLink), store.clone());
        let r = replicator
            .find_or_declare(
                "bundle",
                "state",
                ReplicantOpts::default().with_default(json!({"n": 0})),
            )
            .unwrap();

        r.set("/n", json!(7)).unwrap();
        replicator.flush_pending();
        replicator.persistor().unwrap().flush_all();

        assert_eq!(store.read("bundle", "state").unwrap(), Some(json!({"n": 7})));
    }

    #[test]
    fn broadcast_for_unknown_replicant_is_buffered_until_declare() {
        let (link, _rx) = ChannelLink::pair();
        let replicator = Replicator::subscriber(link);

        replicator
            .receive(SyncFrame::Broadcast {
                namespace: "bundle".to_string(),
                name: "late".to_string(),
                revision: 2,
                operations: vec![Operation::update("/", "n", json!(2))],
            })
            .unwrap();

        let r = replicator
            .find_or_declare("bundle", "late", ReplicantOpts::default())
            .unwrap();
        assert_eq!(r.status(), Status::Declaring);

        // The authority's ack lands, then the buffered broadcast replays.
        replicator
            .receive(SyncFrame::DeclareAck {
                id: Uuid::new_v4(),
                namespace: "bundle".to_string(),
                name: "late".to_string(),
                value: Some(json!({"n": 1})),
                revision: 1,
                schema: None,
                schema_sum: None,
            })
            .unwrap();

        assert_eq!(r.status(), Status::Declared);
        assert_eq!(r.value(), Some(json!({"n": 2})));
        assert_eq!(r.revision(), 2);
    }

    #[test]
    fn receive_json_classifies_unknown_methods_as_fatal() {
        let replicator = authority();
        let raw = serde_json::to_string(&json!({
            "type": "propose",
            "id": Uuid::new_v4(),
            "namespace": "bundle",
            "name": "state",
            "operations": [{"path": "/", "method": "transmogrify", "args": {}}]
        }))
        .unwrap();
        let err = replicator.receive_json(&raw).unwrap_err();
        assert!(matches!(err, ReplicantError::UnknownOperationMethod { .. }));
    }
}
