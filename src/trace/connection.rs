use crate::{
    bson::oid::ObjectId,
    event::{
        cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason},
        TracedEvent,
    },
    trace::{failure, CONNECTION_TRACING_EVENT_TARGET},
};

impl TracedEvent for CmapEvent {
    fn tracing_enabled() -> bool {
        tracing::enabled!(target: CONNECTION_TRACING_EVENT_TARGET, tracing::Level::DEBUG)
    }

    fn trace(&self, topology_id: &ObjectId) {
        match self {
            CmapEvent::PoolCreated(event) => {
                let options = event.options.as_ref();
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topology_id = %topology_id,
                    server = %event.address,
                    max_pool_size = options.and_then(|o| o.max_pool_size),
                    min_pool_size = options.and_then(|o| o.min_pool_size),
                    max_idle_time_ms = options.and_then(|o| o.max_idle_time).map(|d| d.as_millis()),
                    "Connection pool created",
                );
            }
            CmapEvent::PoolReady(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                "Connection pool ready",
            ),
            CmapEvent::PoolCleared(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                generation = event.generation,
                "Connection pool cleared",
            ),
            CmapEvent::PoolClosed(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                "Connection pool closed",
            ),
            CmapEvent::ConnectionCreated(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                connection_id = event.connection_id,
                "Connection created",
            ),
            CmapEvent::ConnectionReady(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                connection_id = event.connection_id,
                elapsed_ms = event.duration.as_millis(),
                "Connection ready",
            ),
            CmapEvent::ConnectionClosed(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                connection_id = event.connection_id,
                reason = closed_reason(event.reason),
                error = event.error.as_ref().map(failure),
                "Connection closed",
            ),
            CmapEvent::ConnectionCheckoutStarted(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                "Connection checkout started",
            ),
            CmapEvent::ConnectionCheckoutFailed(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                reason = checkout_failed_reason(event.reason),
                elapsed_ms = event.duration.as_millis(),
                "Connection checkout failed",
            ),
            CmapEvent::ConnectionCheckedOut(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                connection_id = event.connection_id,
                elapsed_ms = event.duration.as_millis(),
                "Connection checked out",
            ),
            CmapEvent::ConnectionCheckedIn(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.address,
                connection_id = event.connection_id,
                "Connection checked in",
            ),
        }
    }
}

fn closed_reason(reason: ConnectionClosedReason) -> &'static str {
    match reason {
        ConnectionClosedReason::Stale => "stale: the pool was cleared after it was created",
        ConnectionClosedReason::Idle => "idle for longer than maxIdleTime",
        ConnectionClosedReason::Error => "errored while in use",
        ConnectionClosedReason::Dropped => "dropped while an operation was using it",
        ConnectionClosedReason::PoolClosed => "the pool was closed",
    }
}

fn checkout_failed_reason(reason: ConnectionCheckoutFailedReason) -> &'static str {
    match reason {
        ConnectionCheckoutFailedReason::Timeout => "timed out in the wait queue",
        ConnectionCheckoutFailedReason::ConnectionError => "could not establish a connection",
    }
}
