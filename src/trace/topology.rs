use crate::{
    bson::oid::ObjectId,
    event::{sdam::SdamEvent, TracedEvent},
    trace::{failure, json, TOPOLOGY_TRACING_EVENT_TARGET},
};

impl TracedEvent for SdamEvent {
    fn tracing_enabled() -> bool {
        // failed heartbeats are logged at warn, so they need to be built when only warn is on.
        tracing::enabled!(target: TOPOLOGY_TRACING_EVENT_TARGET, tracing::Level::WARN)
    }

    fn trace(&self, topology_id: &ObjectId) {
        match self {
            // covered by the topology-level change below.
            SdamEvent::ServerDescriptionChanged(_) => {}
            SdamEvent::TopologyOpening(_) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                "Topology monitoring started"
            ),
            SdamEvent::TopologyClosed(_) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                "Topology monitoring stopped"
            ),
            SdamEvent::TopologyDescriptionChanged(event) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                previous = %event.previous_description,
                new = %event.new_description,
                "Topology description changed"
            ),
            SdamEvent::ServerOpening(event) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                "Server monitoring started"
            ),
            SdamEvent::ServerClosed(event) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                "Server monitoring stopped"
            ),
            SdamEvent::ServerHeartbeatStarted(event) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.server_address,
                "Heartbeat started"
            ),
            SdamEvent::ServerHeartbeatSucceeded(event) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.server_address,
                elapsed_ms = event.duration.as_millis(),
                reply = json(&event.reply),
                "Heartbeat succeeded"
            ),
            SdamEvent::ServerHeartbeatFailed(event) => tracing::warn!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.server_address,
                consecutive_failures = event.consecutive_failures,
                elapsed_ms = event.duration.as_millis(),
                failure = failure(&event.failure),
                "Heartbeat failed"
            ),
        }
    }
}
