use crate::{
    bson::oid::ObjectId,
    event::{command::CommandEvent, TracedEvent},
    trace::{failure, json, COMMAND_TRACING_EVENT_TARGET},
};

impl TracedEvent for CommandEvent {
    fn tracing_enabled() -> bool {
        tracing::enabled!(target: COMMAND_TRACING_EVENT_TARGET, tracing::Level::DEBUG)
    }

    fn trace(&self, topology_id: &ObjectId) {
        match self {
            CommandEvent::Started(event) => tracing::debug!(
                target: COMMAND_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.connection.address,
                connection_id = event.connection.id,
                server_connection_id = event.connection.server_id,
                request_id = event.request_id,
                db = %event.db,
                command_name = %event.command_name,
                command = json(&event.command),
                "Command started"
            ),
            CommandEvent::Succeeded(event) => tracing::debug!(
                target: COMMAND_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.connection.address,
                connection_id = event.connection.id,
                request_id = event.request_id,
                command_name = %event.command_name,
                elapsed_ms = event.duration.as_millis(),
                reply = json(&event.reply),
                "Command succeeded"
            ),
            CommandEvent::Failed(event) => tracing::debug!(
                target: COMMAND_TRACING_EVENT_TARGET,
                topology_id = %topology_id,
                server = %event.connection.address,
                connection_id = event.connection.id,
                request_id = event.request_id,
                command_name = %event.command_name,
                elapsed_ms = event.duration.as_millis(),
                failure = failure(&event.failure),
                "Command failed"
            ),
        }
    }
}
