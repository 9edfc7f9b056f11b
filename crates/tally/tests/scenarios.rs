//! End-to-end behavior of a local authority: declared replicants, the path
//! mutation API, flush batches, and the operation wire shapes.

use serde_json::{json, Value};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use tally::link::ChannelLink;
use tally::{ReplicantOpts, Replicator, SeqMethod, SyncFrame};

fn authority() -> (Replicator, Receiver<SyncFrame>) {
    let (link, rx) = ChannelLink::pair();
    (Replicator::authority(link), rx)
}

fn broadcast_ops(rx: &Receiver<SyncFrame>) -> Vec<(u64, Vec<Value>)> {
    rx.try_iter()
        .filter_map(|frame| match frame {
            SyncFrame::Broadcast {
                revision,
                operations,
                ..
            } => Some((
                revision,
                operations
                    .iter()
                    .map(|op| serde_json::to_value(op).unwrap())
                    .collect(),
            )),
            _ => None,
        })
        .collect()
}

#[test]
fn nested_assignment_emits_one_update() {
    let (replicator, rx) = authority();
    let r = replicator
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default().with_default(json!({"a": {"b": [1, 2]}})),
        )
        .unwrap();

    r.set("/a/b/1", json!(9)).unwrap();
    replicator.flush_pending();

    let flushes = broadcast_ops(&rx);
    assert_eq!(flushes.len(), 1);
    let (revision, ops) = &flushes[0];
    assert_eq!(*revision, 1);
    assert_eq!(
        ops,
        &vec![json!({
            "path": "/a/b",
            "method": "update",
            "args": {"prop": "1", "newValue": 9}
        })]
    );
    assert_eq!(r.get("/a/b"), Some(json!([1, 9])));
    assert_eq!(r.revision(), 1);
}

#[test]
fn array_mutator_emits_push_with_literal_args() {
    let (replicator, rx) = authority();
    let r = replicator
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default().with_default(json!({"xs": [1, 2, 3]})),
        )
        .unwrap();

    r.mutate("/xs", SeqMethod::Push, vec![json!(4), json!(5)])
        .unwrap();
    replicator.flush_pending();

    let flushes = broadcast_ops(&rx);
    assert_eq!(flushes.len(), 1);
    let (revision, ops) = &flushes[0];
    assert_eq!(*revision, 1);
    assert_eq!(
        ops,
        &vec![json!({
            "path": "/xs",
            "method": "push",
            "args": {"prop": "xs", "mutatorArgs": [4, 5]}
        })]
    );
    assert_eq!(r.get("/xs"), Some(json!([1, 2, 3, 4, 5])));
}

#[test]
fn schema_rejection_leaves_everything_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = dir.path().join("schema.json");
    std::fs::write(
        &schema_path,
        serde_json::to_vec(&json!({
            "type": "object",
            "properties": {"count": {"type": "number"}}
        }))
        .unwrap(),
    )
    .unwrap();

    let (replicator, rx) = authority();
    let r = replicator
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default()
                .with_default(json!({"count": 0}))
                .with_schema_path(&schema_path),
        )
        .unwrap();

    let err = r.set("/count", json!("oops")).unwrap_err();
    assert!(matches!(err, tally::ReplicantError::SchemaValidation { .. }));

    replicator.flush_pending();
    assert!(broadcast_ops(&rx).is_empty());
    assert_eq!(r.revision(), 0);
    assert_eq!(r.get("/count"), Some(json!(0)));
}

#[test]
fn keys_containing_slashes_are_escaped() {
    let (replicator, rx) = authority();
    let r = replicator
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default().with_default(json!({})),
        )
        .unwrap();

    r.set("/a~1b", json!(1)).unwrap();
    replicator.flush_pending();

    let flushes = broadcast_ops(&rx);
    assert_eq!(
        flushes[0].1,
        vec![json!({
            "path": "/a~1b",
            "method": "add",
            "args": {"prop": "a/b", "newValue": 1}
        })]
    );
    assert_eq!(r.value(), Some(json!({"a/b": 1})));
}

#[test]
fn grafting_across_replicants_is_rejected() {
    let (replicator, _rx) = authority();
    let a = replicator
        .find_or_declare(
            "bundle",
            "a",
            ReplicantOpts::default().with_default(json!({})),
        )
        .unwrap();
    let b = replicator
        .find_or_declare(
            "bundle",
            "b",
            ReplicantOpts::default().with_default(json!({})),
        )
        .unwrap();

    a.set("/x", json!({"k": 1})).unwrap();

    let err = b.set("/y", a.at("/x")).unwrap_err();
    match err {
        tally::ReplicantError::CrossOwnership { owner, target, .. } => {
            assert_eq!(owner, "bundle/a");
            assert_eq!(target, "bundle/b");
        }
        other => panic!("expected cross-ownership rejection, got {other:?}"),
    }
    assert_eq!(b.value(), Some(json!({})));
}

#[test]
fn one_shot_listener_fires_once_in_declared_state() {
    let (replicator, _rx) = authority();
    let r = replicator
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default().with_default(json!({"n": 0})),
        )
        .unwrap();

    let persistent_seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let once_seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = persistent_seen.clone();
    r.on_change(move |new, _, _| sink.lock().unwrap().push(new.cloned()));
    let sink = once_seen.clone();
    r.once_change(move |new, _, _| sink.lock().unwrap().push(new.cloned()));

    // Both fired immediately with the current value.
    assert_eq!(*persistent_seen.lock().unwrap(), vec![Some(json!({"n": 0}))]);
    assert_eq!(*once_seen.lock().unwrap(), vec![Some(json!({"n": 0}))]);

    r.set("/n", json!(1)).unwrap();
    replicator.flush_pending();

    // The persistent listener saw the mutation; the one-shot did not rearm.
    assert_eq!(
        *persistent_seen.lock().unwrap(),
        vec![Some(json!({"n": 0})), Some(json!({"n": 1}))]
    );
    assert_eq!(*once_seen.lock().unwrap(), vec![Some(json!({"n": 0}))]);
}

#[test]
fn replaying_a_batch_reproduces_the_final_value() {
    let (replicator, rx) = authority();
    let before = json!({"a": {"b": [1, 2]}, "n": 0});
    let r = replicator
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default().with_default(before.clone()),
        )
        .unwrap();

    r.set("/a/b/1", json!(9)).unwrap();
    r.mutate("/a/b", SeqMethod::Unshift, vec![json!(0)]).unwrap();
    r.set("/label", json!("on air")).unwrap();
    r.delete("/n").unwrap();
    replicator.flush_pending();

    let operations: Vec<tally::Operation> = rx
        .try_iter()
        .filter_map(|frame| match frame {
            SyncFrame::Broadcast { operations, .. } => Some(operations),
            _ => None,
        })
        .flatten()
        .collect();

    let replayed = tally::apply::replay(Some(before), &operations).unwrap();
    assert_eq!(replayed, r.value());
}

#[test]
fn repeated_overwrite_collapses_to_one_revision() {
    let (replicator, rx) = authority();
    let r = replicator
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default().with_default(json!({"n": 0})),
        )
        .unwrap();

    r.replace(json!({"n": 1})).unwrap();
    r.replace(json!({"n": 1})).unwrap();
    replicator.flush_pending();

    let flushes = broadcast_ops(&rx);
    assert_eq!(flushes.len(), 1);
    let (revision, ops) = &flushes[0];
    assert_eq!(*revision, 1);
    assert_eq!(ops.len(), 1);
    assert_eq!(r.value(), Some(json!({"n": 1})));
    assert_eq!(r.revision(), 1);
}

#[test]
fn revision_counts_non_empty_flushes_only() {
    let (replicator, _rx) = authority();
    let r = replicator
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default().with_default(json!({"n": 0})),
        )
        .unwrap();

    for turn in 1..=5u64 {
        r.set("/n", json!(turn)).unwrap();
        replicator.flush_pending();
        // Interleave empty turns; they must not advance the revision.
        replicator.flush_pending();
    }
    assert_eq!(r.revision(), 5);
}
