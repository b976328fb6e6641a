mod cluster_time;
#[cfg(test)]
mod test;

use std::time::Instant;

use uuid::Uuid;

use crate::bson::{doc, spec::BinarySubtype, Binary, Document, Timestamp};
pub use cluster_time::ClusterTime;
pub(crate) use cluster_time::timestamp_key;

/// A logical session: an id the server uses to group operations, plus the causal-consistency
/// state observed through it.
///
/// Commands run in a session send its lsid and the highest `$clusterTime` it has seen. Once a
/// session has an operation time, its reads ask the server for data at least that recent, so
/// the session reads its own writes.
///
/// Start one with [`Client::start_session`](crate::Client::start_session). A session is used by
/// one operation at a time.
#[derive(Debug)]
pub struct ClientSession {
    /// `{ id: <UUID binary> }`, sent as `lsid`.
    id: Document,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    /// Created by the driver for a single operation rather than by the caller.
    is_implicit: bool,
    txn_number: i64,
    last_use: Instant,
}

impl ClientSession {
    pub(crate) fn new(is_implicit: bool) -> Self {
        let uuid = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        };
        Self {
            id: doc! { "id": uuid },
            cluster_time: None,
            operation_time: None,
            is_implicit,
            txn_number: 0,
            last_use: Instant::now(),
        }
    }

    /// The `lsid` document.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// Highest cluster time seen through this session, if it has been used.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The `operationTime` of the latest reply in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Moves the session's cluster time forward to `to`. Older times are ignored.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time.as_ref() < Some(to) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Moves the session's operation time forward to `ts`. Older times are ignored.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        let newer = self
            .operation_time
            .is_none_or(|current| timestamp_key(ts) > timestamp_key(current));
        if newer {
            self.operation_time = Some(ts);
        }
    }

    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// The `txnNumber` for the next retryable write. A retry reuses the number of its first
    /// attempt instead of calling this again.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        self.txn_number += 1;
        self.txn_number
    }

    /// A copy carrying the same lsid and times, owned by a cursor so its getMores run in this
    /// session. Times observed through the copy are not reflected back here.
    pub(crate) fn detached(&self) -> ClientSession {
        Self {
            id: self.id.clone(),
            cluster_time: self.cluster_time.clone(),
            operation_time: self.operation_time,
            is_implicit: self.is_implicit,
            txn_number: self.txn_number,
            last_use: self.last_use,
        }
    }

    pub(crate) fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn last_use(&self) -> Instant {
        self.last_use
    }
}
