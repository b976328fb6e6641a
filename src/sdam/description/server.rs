use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{oid::ObjectId, DateTime},
    client::session::ClusterTime,
    error::Error,
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

/// The number of consecutive failed checks after which a server is reported with reduced
/// confidence.
pub(crate) const REDUCED_CONFIDENCE_THRESHOLD: u32 = 3;

/// Enum representing the possible types of servers that the driver can connect to.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
        )
    }

    /// Whether a server of this type is "available" for server selection purposes.
    pub fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A description of the most up-to-date information known about a server.
///
/// Descriptions are produced by the monitor for each check and are never mutated once they have
/// been published as part of a [`TopologyDescription`](crate::TopologyDescription).
#[derive(Debug, Clone)]
pub struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The exponentially weighted moving average of this server's round trip times.
    pub(crate) average_round_trip_time: Option<Duration>,

    /// The number of checks in a row that have failed for this server.
    pub(crate) consecutive_failures: u32,

    // A server description either holds the reply to its latest check, the error that check
    // failed with, or (for a server that hasn't been checked yet) neither.
    pub(crate) reply: Result<Option<HelloReply>, Error>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.raw_command_response);
                let other_response = other_reply.as_ref().map(|r| &r.raw_command_response);

                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => {
                self_err.to_string() == other_err.to_string()
                    && self.consecutive_failures == other.consecutive_failures
            }
            _ => false,
        }
    }
}

impl ServerDescription {
    /// A description for a server that has not been checked yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: normalize(address),
            server_type: Default::default(),
            last_update_time: None,
            average_round_trip_time: None,
            consecutive_failures: 0,
            reply: Ok(None),
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let mut description = Self::new(&address);
        description.average_round_trip_time = Some(average_rtt);
        description.last_update_time = Some(DateTime::now());

        // Infer the server type from the hello response.
        description.server_type = reply.command_response.server_type();

        // hostnames compare case-insensitively.
        for hosts in [
            reply.command_response.hosts.as_mut(),
            reply.command_response.passives.as_mut(),
            reply.command_response.arbiters.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            for host in hosts.iter_mut() {
                *host = host.to_lowercase();
            }
        }

        if let Some(ref mut me) = reply.command_response.me {
            *me = me.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.reply = Err(error);
        description
    }

    /// The address of this server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The type of this server.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// The average round trip time observed by this server's monitor, if it has been checked.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.average_round_trip_time
    }

    /// The last time this server was checked.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.last_update_time
    }

    /// The error the latest check of this server failed with, if any.
    pub fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    /// Whether the recent checks of this server have failed often enough that its description
    /// should be treated with reduced confidence. Such a server remains in the topology as
    /// `Unknown` until it recovers.
    pub fn reduced_confidence(&self) -> bool {
        self.consecutive_failures >= REDUCED_CONFIDENCE_THRESHOLD
    }

    /// Any type other than `Unknown`.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    fn reply(&self) -> Option<&HelloReply> {
        self.reply.as_ref().ok().and_then(Option::as_ref)
    }

    /// The replica set name reported by this server.
    pub fn set_name(&self) -> Option<&str> {
        self.reply()
            .and_then(|reply| reply.command_response.set_name.as_deref())
    }

    /// The replica set config version reported by this server.
    pub fn set_version(&self) -> Option<i32> {
        self.reply()
            .and_then(|reply| reply.command_response.set_version)
    }

    /// The election id reported by this server.
    pub fn election_id(&self) -> Option<ObjectId> {
        self.reply()
            .and_then(|reply| reply.command_response.election_id)
    }

    /// The maximum wire version this server supports.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.reply()
            .and_then(|reply| reply.command_response.max_wire_version)
    }

    /// The tags configured for this replica set member.
    pub fn tags(&self) -> Option<&TagSet> {
        self.reply()
            .and_then(|reply| reply.command_response.tags.as_ref())
    }

    pub(crate) fn known_hosts(&self) -> Vec<ServerAddress> {
        let Some(reply) = self.reply() else {
            return Vec::new();
        };
        let response = &reply.command_response;

        response
            .hosts
            .iter()
            .flatten()
            .chain(response.passives.iter().flatten())
            .chain(response.arbiters.iter().flatten())
            .filter_map(|host| ServerAddress::parse(host).ok())
            .collect()
    }

    pub(crate) fn invalid_me(&self) -> bool {
        self.reply()
            .and_then(|reply| reply.command_response.me.as_ref())
            .map(|me| &self.address.to_string() != me)
            .unwrap_or(false)
    }

    pub(crate) fn last_write_date(&self) -> Option<DateTime> {
        self.reply()
            .and_then(|reply| reply.command_response.last_write.as_ref())
            .map(|write| write.last_write_date)
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.reply()
            .and_then(|reply| reply.command_response.logical_session_timeout_minutes)
            .map(|timeout| Duration::from_secs(timeout.max(0) as u64 * 60))
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.reply().and_then(|reply| reply.cluster_time.as_ref())
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return tag_set.is_empty(),
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

fn normalize(address: &ServerAddress) -> ServerAddress {
    match address {
        ServerAddress::Tcp { host, port } => ServerAddress::Tcp {
            host: host.to_lowercase(),
            port: *port,
        },
    }
}
