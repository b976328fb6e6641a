use std::time::Duration;

pub use crate::sdam::description::{
    server::{ServerDescription, ServerType},
    topology::{TopologyDescription, TopologyType},
};
use crate::{bson::DateTime, options::ServerAddress, selection_criteria::TagSet};

/// A borrowed view of a server's description, handed to custom selection predicates.
#[derive(Clone, Debug)]
pub struct ServerInfo<'a> {
    description: &'a ServerDescription,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new(description: &'a ServerDescription) -> Self {
        Self { description }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// from the driver to the server.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the last time that the driver's monitoring task for the server successfully
    /// received a server check reply.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// Gets the maximum wire version that the server supports.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.description.max_wire_version()
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the name of the replica set that the server is part of.
    pub fn set_name(&self) -> Option<&str> {
        self.description.set_name()
    }

    /// Gets the tags associated with the server.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags()
    }
}
