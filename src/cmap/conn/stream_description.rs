use std::time::Duration;

use crate::{hello::HelloReply, options::ServerAddress, sdam::ServerType};

/// Oldest wire version that accepts `txnNumber` on writes.
const RETRYABLE_WRITES_WIRE_VERSION: i32 = 6;

/// What a connection learned about its server from the handshake. Fixed for the life of the
/// connection, unlike the topology's view of the same server.
#[derive(Debug, Default, Clone)]
pub(crate) struct StreamDescription {
    pub(crate) server_address: ServerAddress,
    pub(crate) initial_server_type: ServerType,
    pub(crate) max_wire_version: Option<i32>,
    /// `None` when the server does not support sessions.
    pub(crate) logical_session_timeout: Option<Duration>,
    pub(crate) max_message_size_bytes: i32,
}

impl StreamDescription {
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .and_then(|minutes| u64::try_from(minutes).ok())
                .map(|minutes| Duration::from_secs(minutes * 60)),
            max_message_size_bytes: response.max_message_size_bytes,
        }
    }

    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.supports_sessions()
            && self.initial_server_type != ServerType::Standalone
            && self
                .max_wire_version
                .is_some_and(|version| version >= RETRYABLE_WRITES_WIRE_VERSION)
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }
}
