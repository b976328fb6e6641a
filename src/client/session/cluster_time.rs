use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::bson::{Document, Timestamp};

/// A `$clusterTime` as gossiped by the server.
///
/// Ordering and equality look at the timestamp alone. The signature is opaque to the client and
/// is sent back exactly as received.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,
    pub(crate) signature: Document,
}

impl ClusterTime {
    #[allow(missing_docs)]
    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }
}

impl PartialEq for ClusterTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ClusterTime {}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> Ordering {
        timestamp_key(self.cluster_time).cmp(&timestamp_key(other.cluster_time))
    }
}

/// Sorts timestamps by seconds, then by increment within the second.
pub(crate) fn timestamp_key(ts: Timestamp) -> (u32, u32) {
    (ts.time, ts.increment)
}
