use std::time::{Duration, Instant};

use super::{failure, SERVER_SELECTION_TRACING_EVENT_TARGET};
use crate::{
    bson::oid::ObjectId,
    error::Error,
    options::ServerAddress,
    sdam::TopologyDescription,
    selection_criteria::SelectionCriteria,
};

/// Logs the progress of a single server selection.
pub(crate) struct SelectionTrace<'a> {
    pub(crate) topology_id: ObjectId,
    pub(crate) criteria: &'a SelectionCriteria,
    pub(crate) operation: &'a str,
    pub(crate) deadline: Instant,
}

impl SelectionTrace<'_> {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub(crate) fn started(&self, topology: &TopologyDescription) {
        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            topology_id = %self.topology_id,
            operation = self.operation,
            selector = %self.criteria,
            topology = %topology,
            "Server selection started"
        );
    }

    pub(crate) fn waiting(&self, topology: &TopologyDescription) {
        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            topology_id = %self.topology_id,
            operation = self.operation,
            selector = %self.criteria,
            topology = %topology,
            remaining_ms = self.remaining().as_millis(),
            "Waiting for a suitable server"
        );
    }

    pub(crate) fn succeeded(&self, server: &ServerAddress) {
        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            topology_id = %self.topology_id,
            operation = self.operation,
            selector = %self.criteria,
            server = %server,
            "Server selection succeeded"
        );
    }

    pub(crate) fn failed(&self, topology: &TopologyDescription, error: &Error) {
        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            topology_id = %self.topology_id,
            operation = self.operation,
            selector = %self.criteria,
            topology = %topology,
            failure = failure(error),
            "Server selection failed"
        );
    }
}
