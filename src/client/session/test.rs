use pretty_assertions::assert_eq;

use super::{ClientSession, ClusterTime};
use crate::bson::{doc, spec::BinarySubtype, Bson, Timestamp};

fn cluster_time(time: u32, increment: u32) -> ClusterTime {
    ClusterTime {
        cluster_time: Timestamp { time, increment },
        signature: doc! { "keyId": 1_i64 },
    }
}

#[test]
fn lsid_is_uuid_binary() {
    let session = ClientSession::new(false);
    match session.id().get("id") {
        Some(Bson::Binary(binary)) => {
            assert_eq!(binary.subtype, BinarySubtype::Uuid);
            assert_eq!(binary.bytes.len(), 16);
        }
        other => panic!("expected binary lsid, got {:?}", other),
    }

    let other = ClientSession::new(true);
    assert_ne!(session.id(), other.id());
    assert!(other.is_implicit());
}

#[test]
fn cluster_time_only_advances() {
    let mut session = ClientSession::new(false);
    assert!(session.cluster_time().is_none());

    session.advance_cluster_time(&cluster_time(10, 2));
    assert_eq!(session.cluster_time(), Some(&cluster_time(10, 2)));

    session.advance_cluster_time(&cluster_time(10, 1));
    assert_eq!(
        session.cluster_time().map(|ct| ct.timestamp()),
        Some(Timestamp {
            time: 10,
            increment: 2
        })
    );

    session.advance_cluster_time(&cluster_time(11, 0));
    assert_eq!(
        session.cluster_time().map(|ct| ct.timestamp()),
        Some(Timestamp {
            time: 11,
            increment: 0
        })
    );
}

#[test]
fn cluster_time_equality_ignores_signature() {
    let mut other = cluster_time(5, 5);
    other.signature = doc! { "hash": "different" };
    assert_eq!(cluster_time(5, 5), other);
    assert!(cluster_time(5, 4) < cluster_time(5, 5));
}

#[test]
fn operation_time_only_advances() {
    let mut session = ClientSession::new(false);
    assert!(session.operation_time().is_none());

    let later = Timestamp {
        time: 20,
        increment: 1,
    };
    let earlier = Timestamp {
        time: 19,
        increment: 7,
    };

    session.advance_operation_time(later);
    session.advance_operation_time(earlier);
    assert_eq!(session.operation_time(), Some(later));
}

#[test]
fn txn_number_increments() {
    let mut session = ClientSession::new(true);
    assert_eq!(session.get_and_increment_txn_number(), 1);
    assert_eq!(session.get_and_increment_txn_number(), 2);

    let before = session.last_use();
    session.update_last_use();
    assert!(session.last_use() >= before);
}
