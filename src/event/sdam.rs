//! Events describing how the client sees the deployment: monitors' heartbeats and changes to
//! server and topology descriptions.

use std::time::Duration;

use derive_more::From;

use crate::{
    bson::{oid::ObjectId, Document},
    error::Error,
    event::EventEmitter,
    options::ServerAddress,
};

pub use crate::sdam::public::{ServerDescription, TopologyDescription, TopologyType};

/// A monitor observed a change in what is known about one server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
    /// The server in question.
    pub address: ServerAddress,
    /// What was known before the check.
    pub previous_description: ServerDescription,
    /// What the check found.
    pub new_description: ServerDescription,
}

/// A server entered the topology and its monitor is starting.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
    /// The server in question.
    pub address: ServerAddress,
}

/// A server left the topology, either because discovery removed it or because the topology shut
/// down.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
    /// The server in question.
    pub address: ServerAddress,
}

/// The topology as a whole changed, e.g. it learned its type or a member changed role.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
    /// The topology before the change.
    pub previous_description: TopologyDescription,
    /// The topology after the change.
    pub new_description: TopologyDescription,
}

/// Emitted once when a client starts monitoring its deployment.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
}

/// Emitted once monitoring stops, after [`Client::shutdown`](crate::Client::shutdown) or when the
/// last client handle goes away.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
}

/// A monitor sent a handshake to check on its server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The server being checked.
    pub server_address: ServerAddress,
}

/// A heartbeat got a reply.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The server being checked.
    pub server_address: ServerAddress,
    /// Round trip time of this check.
    pub duration: Duration,
    /// The server's raw handshake reply.
    pub reply: Document,
}

/// A heartbeat failed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The server being checked.
    pub server_address: ServerAddress,
    /// Time spent before the check failed.
    pub duration: Duration,
    /// Why the check failed.
    pub failure: Error,
    /// Failed checks in a row for this server, counting this one.
    pub consecutive_failures: u32,
}

/// Every deployment monitoring event.
#[derive(Clone, Debug, From)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Emits monitoring events, also logged under the topology target.
pub(crate) type SdamEventEmitter = EventEmitter<SdamEvent>;
