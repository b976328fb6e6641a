//! Events for each command sent on an application connection. Monitoring traffic is not
//! reported here; see [`sdam`](super::sdam) for heartbeats.

use std::time::Duration;

use derive_more::From;
use serde::Serialize;

use crate::{bson::Document, error::Error, event::EventEmitter, options::ServerAddress};

/// A command is about to be written to a connection.
#[allow(missing_docs)]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The full command document, including `$db`, `lsid` and `$clusterTime`.
    pub command: Document,
    pub db: String,
    pub command_name: String,
    /// Matches the `request_id` of the event that ends this command.
    pub request_id: i32,
    pub connection: ConnectionInfo,
    pub session_id: Option<Document>,
}

/// The server replied with `ok: 1`.
#[allow(missing_docs)]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// From just before the write to just after the reply was read.
    #[serde(skip)]
    pub duration: Duration,
    pub reply: Document,
    pub command_name: String,
    pub request_id: i32,
    pub connection: ConnectionInfo,
}

/// The command failed, either on the server or on the way there and back.
#[allow(missing_docs)]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CommandFailedEvent {
    #[serde(skip)]
    pub duration: Duration,
    pub command_name: String,
    #[serde(skip)]
    pub failure: Error,
    pub request_id: i32,
    pub connection: ConnectionInfo,
}

/// Identifies the connection a command ran on.
#[allow(missing_docs)]
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// The id the pool gave the connection, as seen in connection events.
    pub id: u32,

    /// The id the server gave the connection during the handshake, if it sent one.
    pub server_id: Option<i64>,

    pub address: ServerAddress,
}

/// Any command event.
#[derive(Clone, Debug, From)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

impl CommandEvent {
    #[allow(missing_docs)]
    pub fn command_name(&self) -> &str {
        match self {
            Self::Started(CommandStartedEvent { command_name, .. })
            | Self::Succeeded(CommandSucceededEvent { command_name, .. })
            | Self::Failed(CommandFailedEvent { command_name, .. }) => command_name,
        }
    }

    #[allow(missing_docs)]
    pub fn request_id(&self) -> i32 {
        match self {
            Self::Started(CommandStartedEvent { request_id, .. })
            | Self::Succeeded(CommandSucceededEvent { request_id, .. })
            | Self::Failed(CommandFailedEvent { request_id, .. }) => *request_id,
        }
    }

    /// The connection the command ran on.
    pub fn connection(&self) -> &ConnectionInfo {
        match self {
            Self::Started(CommandStartedEvent { connection, .. })
            | Self::Succeeded(CommandSucceededEvent { connection, .. })
            | Self::Failed(CommandFailedEvent { connection, .. }) => connection,
        }
    }
}

pub(crate) type CommandEventEmitter = EventEmitter<CommandEvent>;
