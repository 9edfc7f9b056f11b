//! An authority and a subscriber wired back-to-back through in-process
//! channels: the declaration handshake, broadcast propagation, subscriber
//! proposals and their authoritative echo.

use serde_json::{json, Value};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use tally::link::ChannelLink;
use tally::{ReplicantOpts, Replicator, SeqMethod, Status, SyncFrame};

struct Pair {
    authority: Replicator,
    authority_out: Receiver<SyncFrame>,
    subscriber: Replicator,
    subscriber_out: Receiver<SyncFrame>,
}

impl Pair {
    fn new() -> Self {
        let (a_link, authority_out) = ChannelLink::pair();
        let (s_link, subscriber_out) = ChannelLink::pair();
        Self {
            authority: Replicator::authority(a_link),
            authority_out,
            subscriber: Replicator::subscriber(s_link),
            subscriber_out,
        }
    }

    /// Ferry frames both ways until neither side has anything in flight.
    fn settle(&self) {
        loop {
            let to_subscriber: Vec<SyncFrame> = self.authority_out.try_iter().collect();
            let to_authority: Vec<SyncFrame> = self.subscriber_out.try_iter().collect();
            if to_subscriber.is_empty() && to_authority.is_empty() {
                break;
            }
            for frame in to_subscriber {
                self.subscriber.receive(frame).unwrap();
            }
            self.subscriber.flush_pending();
            for frame in to_authority {
                // Rejected proposals surface as errors here and as error
                // acks on the wire; both are expected in these tests.
                let _ = self.authority.receive(frame);
            }
            self.authority.flush_pending();
        }
    }
}

#[test]
fn declaration_handshake_delivers_value_and_revision() {
    let pair = Pair::new();
    let served = pair
        .authority
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default()
                .ephemeral()
                .with_default(json!({"n": 0})),
        )
        .unwrap();
    served.set("/n", json!(3)).unwrap();
    pair.authority.flush_pending();
    // Drop the broadcast nobody is subscribed to yet.
    pair.authority_out.try_iter().count();

    let mirror = pair
        .subscriber
        .find_or_declare("bundle", "state", ReplicantOpts::default().ephemeral())
        .unwrap();
    assert_eq!(mirror.status(), Status::Declaring);

    pair.settle();

    assert_eq!(mirror.status(), Status::Declared);
    assert_eq!(mirror.value(), Some(json!({"n": 3})));
    assert_eq!(mirror.revision(), 1);
}

#[test]
fn authority_mutations_propagate_to_subscriber() {
    let pair = Pair::new();
    let served = pair
        .authority
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default()
                .ephemeral()
                .with_default(json!({"xs": [1]})),
        )
        .unwrap();
    let mirror = pair
        .subscriber
        .find_or_declare("bundle", "state", ReplicantOpts::default().ephemeral())
        .unwrap();
    pair.settle();

    let changes: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    mirror.on_change(move |new, _, _| sink.lock().unwrap().push(new.cloned()));

    served
        .mutate("/xs", SeqMethod::Push, vec![json!(2), json!(3)])
        .unwrap();
    pair.authority.flush_pending();
    pair.settle();

    assert_eq!(mirror.value(), Some(json!({"xs": [1, 2, 3]})));
    assert_eq!(mirror.revision(), served.revision());
    // One immediate fire at registration plus one per applied batch.
    assert_eq!(
        *changes.lock().unwrap(),
        vec![Some(json!({"xs": [1]})), Some(json!({"xs": [1, 2, 3]}))]
    );
}

#[test]
fn subscriber_proposal_round_trips_through_the_authority() {
    let pair = Pair::new();
    let served = pair
        .authority
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default()
                .ephemeral()
                .with_default(json!({"n": 0})),
        )
        .unwrap();
    let mirror = pair
        .subscriber
        .find_or_declare("bundle", "state", ReplicantOpts::default().ephemeral())
        .unwrap();
    pair.settle();

    mirror.set("/n", json!(5)).unwrap();
    // The local tree is untouched until the authority confirms.
    assert_eq!(mirror.get("/n"), Some(json!(0)));

    pair.subscriber.flush_pending();
    pair.settle();

    assert_eq!(served.get("/n"), Some(json!(5)));
    assert_eq!(mirror.get("/n"), Some(json!(5)));
    assert_eq!(mirror.revision(), served.revision());
}

#[test]
fn schema_violating_proposal_is_rejected_with_an_error_ack() {
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

    let pair = Pair::new();
    let served = pair
        .authority
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default()
                .ephemeral()
                .with_default(json!({"count": 0}))
                .with_schema_path(&schema_path),
        )
        .unwrap();
    let mirror = pair
        .subscriber
        .find_or_declare("bundle", "state", ReplicantOpts::default().ephemeral())
        .unwrap();
    pair.settle();

    // The subscriber adopted the authority's schema during the handshake,
    // so an invalid write is refused before it is even proposed.
    let err = mirror.set("/count", json!("oops")).unwrap_err();
    assert!(matches!(err, tally::ReplicantError::SchemaValidation { .. }));

    // Hand the authority a raw proposal, as a client with no schema would.
    let bad = SyncFrame::Propose {
        id: uuid::Uuid::new_v4(),
        namespace: "bundle".to_string(),
        name: "state".to_string(),
        operations: vec![tallyproto::Operation::update("/", "count", json!("oops"))],
    };
    let verdict = pair.authority.receive(bad);
    assert!(verdict.is_err());

    let acks: Vec<SyncFrame> = pair.authority_out.try_iter().collect();
    let rejected = acks.iter().any(|frame| {
        matches!(
            frame,
            SyncFrame::ProposeAck { error: Some(e), .. }
                if e.kind == tallyproto::ErrorKind::SchemaValidationError
        )
    });
    assert!(rejected, "expected a schema-validation error ack, got {acks:?}");
    assert_eq!(served.get("/count"), Some(json!(0)));
}

#[test]
fn subscriber_adopts_the_authoritys_schema_on_sum_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = dir.path().join("schema.json");
    std::fs::write(
        &schema_path,
        serde_json::to_vec(&json!({
            "type": "object",
            "properties": {"n": {"type": "number"}}
        }))
        .unwrap(),
    )
    .unwrap();

    let pair = Pair::new();
    pair.authority
        .find_or_declare(
            "bundle",
            "state",
            ReplicantOpts::default()
                .ephemeral()
                .with_default(json!({"n": 0}))
                .with_schema_path(&schema_path),
        )
        .unwrap();
    let mirror = pair
        .subscriber
        .find_or_declare("bundle", "state", ReplicantOpts::default().ephemeral())
        .unwrap();
    assert_eq!(mirror.schema_sum(), None);

    pair.settle();

    // The handshake shipped the schema; now the mirror enforces it locally.
    assert!(mirror.schema_sum().is_some());
    assert!(mirror.set("/n", json!("not a number")).is_err());
}

#[test]
fn proposals_before_the_authority_declares_are_buffered() {
    let pair = Pair::new();

    pair.authority
        .receive(SyncFrame::Propose {
            id: uuid::Uuid::new_v4(),
            namespace: "bundle".to_string(),
            name: "early".to_string(),
            operations: vec![tallyproto::Operation::add("/", "n", json!(1))],
        })
        .unwrap();

    let served = pair
        .authority
        .find_or_declare(
            "bundle",
            "early",
            ReplicantOpts::default().ephemeral().with_default(json!({})),
        )
        .unwrap();
    pair.authority.flush_pending();

    assert_eq!(served.get("/n"), Some(json!(1)));
    assert_eq!(served.revision(), 1);
}
