//! Last-write-wins replication between two in-process replicas.

use proptest::prelude::*;
use saltpeter_engine::{
    Clock, Config, Database, DeltaState, Document, DocumentId, Filter, FindOptions, FixedClock,
    LastWriteWinMap, Timestamp,
};
use std::sync::Arc;

struct Replica {
    _db: Database,
    clock: Arc<FixedClock>,
    map: LastWriteWinMap,
}

impl Replica {
    fn new(start: Timestamp) -> Self {
        let clock = Arc::new(FixedClock::new(start));
        let db = Database::open_with_clock(
            Config::in_memory().with_event_workers(1),
            clock.clone(),
        )
        .unwrap();
        let map = db.replicated("todos").unwrap();
        Self {
            _db: db,
            clock,
            map,
        }
    }

    fn upsert(&self, id: &str, value: i64) {
        self.clock.advance(2);
        let doc = Document::new().with("_id", id).with("value", value);
        self.map.collection().update_document(&doc, true).unwrap();
    }

    fn remove(&self, id: &str) {
        self.clock.advance(2);
        let mut doc = Document::new();
        doc.set_id(&DocumentId::from(id));
        self.map.collection().remove_document(&doc).unwrap();
    }

    fn everything(&self) -> DeltaState {
        self.map.delta(0, Timestamp::MAX, 0, usize::MAX).unwrap()
    }

    fn documents(&self) -> Vec<Document> {
        self.map
            .collection()
            .find(&Filter::All, &FindOptions::default())
            .unwrap()
    }
}

/// Exchange full deltas in both directions, computed before either merge.
fn sync(a: &Replica, b: &Replica) {
    let from_a = a.everything();
    let from_b = b.everything();
    a.map.merge(&from_b).unwrap();
    b.map.merge(&from_a).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn replicas_converge_after_exchange(
        ops in prop::collection::vec((any::<bool>(), 0u8..5, -100i64..100), 1..40)
    ) {
        // Even timestamps on one side, odd on the other: no exact ties.
        let a = Replica::new(1_000);
        let b = Replica::new(1_001);
        for (on_a, key, value) in &ops {
            let replica = if *on_a { &a } else { &b };
            replica.upsert(&format!("k{key}"), *value);
        }

        sync(&a, &b);
        prop_assert_eq!(a.documents(), b.documents());
    }

    #[test]
    fn merging_the_same_delta_twice_is_a_no_op(
        values in prop::collection::vec((0u8..5, -100i64..100), 1..20)
    ) {
        let a = Replica::new(1_000);
        let b = Replica::new(1_001);
        for (key, value) in &values {
            a.upsert(&format!("k{key}"), *value);
        }

        let delta = a.everything();
        b.map.merge(&delta).unwrap();
        let once = b.documents();
        let again = b.map.merge(&delta).unwrap();

        prop_assert_eq!(again.applied, 0);
        prop_assert_eq!(again.discarded, delta.changes.len());
        prop_assert_eq!(b.documents(), once);
    }
}

#[test]
fn deletes_travel_as_tombstones() {
    let a = Replica::new(1_000);
    let b = Replica::new(1_001);
    a.upsert("k1", 1);
    a.upsert("k2", 2);
    sync(&a, &b);
    assert_eq!(b.documents().len(), 2);

    a.remove("k1");
    let delta = a.everything();
    assert_eq!(delta.tombstones.len(), 1);
    let result = b.map.merge(&delta).unwrap();
    assert_eq!(result.deleted, 1);

    assert_eq!(a.documents(), b.documents());
    let tombstone = b.map.tombstone(&DocumentId::from("k1")).unwrap().unwrap();
    assert_eq!(tombstone.counter, 0);
}

#[test]
fn stale_insert_does_not_resurrect_a_deleted_document() {
    let a = Replica::new(1_000);
    let b = Replica::new(1_001);
    a.upsert("k1", 1);
    let old = a.everything();

    b.map.merge(&old).unwrap();
    b.remove("k1");
    // The old insert arrives again after the delete.
    let result = b.map.merge(&old).unwrap();
    assert_eq!(result.discarded, 1);
    assert!(b.documents().is_empty());

    // A later write on the other side wins over the tombstone.
    a.clock.advance(100);
    a.upsert("k1", 2);
    b.map.merge(&a.everything()).unwrap();
    assert_eq!(b.documents().len(), 1);
    assert!(b.map.tombstone(&DocumentId::from("k1")).unwrap().is_none());
}

#[test]
fn incremental_sync_with_json_transport() {
    let a = Replica::new(1_000);
    let b = Replica::new(1_001);
    for i in 0..10 {
        a.upsert(&format!("k{i}"), i);
    }

    let mut since = b.map.last_sync_time().unwrap().unwrap_or(0);
    let until = a.clock.now_millis();
    let mut offset = 0;
    loop {
        let page = a.map.delta(since, until, offset, 3).unwrap();
        if page.is_empty() {
            break;
        }
        offset += page.changes.len();
        let wire = page.to_json().unwrap();
        b.map.merge(&DeltaState::from_json(&wire).unwrap()).unwrap();
    }
    b.map.set_last_sync_time(until).unwrap();
    assert_eq!(a.documents(), b.documents());

    a.upsert("k3", 33);
    since = b.map.last_sync_time().unwrap().unwrap_or(0);
    let delta = a.map.delta(since, Timestamp::MAX, 0, usize::MAX).unwrap();
    assert_eq!(delta.changes.len(), 1);
    b.map.merge(&delta).unwrap();
    assert_eq!(a.documents(), b.documents());
}

#[test]
fn replicas_have_distinct_ids() {
    let a = Replica::new(1_000);
    let b = Replica::new(1_001);
    assert_ne!(a.map.replica_id().unwrap(), b.map.replica_id().unwrap());
    assert_eq!(a.map.replica_id().unwrap(), a.map.replica_id().unwrap());
}
