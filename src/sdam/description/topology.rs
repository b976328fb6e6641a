pub(crate) mod server_selection;

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    bson::oid::ObjectId,
    client::session::ClusterTime,
    cmap::Command,
    error::Error,
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, ServerType},
        DEFAULT_HEARTBEAT_FREQUENCY,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// The shape of the deployment, as far as discovery has determined it.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum TopologyType {
    /// One server, connected to directly or found to be a standalone.
    Single,

    /// A replica set whose primary is not currently known.
    ReplicaSetNoPrimary,

    /// A replica set with a known primary.
    ReplicaSetWithPrimary,

    /// One or more mongos routers.
    Sharded,

    /// Nothing has been learned yet.
    #[default]
    Unknown,
}

/// A snapshot of what the client knows about the deployment.
///
/// Monitors never modify a published snapshot; each update produces a new one. A description
/// returned by [`Client::topology_description`](crate::Client::topology_description) therefore
/// stays as it was when it was taken.
#[derive(Debug, Clone, Default)]
pub struct TopologyDescription {
    /// Set when the client was given exactly one host, which lets a standalone become `Single`.
    pub(crate) single_seed: bool,
    pub(crate) topology_type: TopologyType,
    pub(crate) set_name: Option<String>,

    /// Newest (electionId, setVersion) seen from a primary. Primaries reporting an older pair
    /// are ignored.
    pub(crate) max_set_version: Option<i32>,
    pub(crate) max_election_id: Option<ObjectId>,

    /// Smallest session timeout among data-bearing servers, or `None` if any of them lacks
    /// session support.
    pub(crate) logical_session_timeout: Option<Duration>,
    pub(crate) cluster_time: Option<ClusterTime>,

    pub(crate) local_threshold: Option<Duration>,
    pub(crate) heartbeat_freq: Option<Duration>,

    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // only what server selection reads counts, so waiting selections wake on real changes.
        self.topology_type == other.topology_type && self.servers == other.servers
    }
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };
        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address)))
            .collect();

        Self {
            single_seed: servers.len() == 1,
            topology_type,
            set_name: options.repl_set_name.clone(),
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            servers,
            ..Default::default()
        }
    }

    #[allow(missing_docs)]
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The replica set name, whether configured or discovered.
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// Newest election id reported by a primary.
    pub fn max_election_id(&self) -> Option<ObjectId> {
        self.max_election_id
    }

    /// Newest replica set config version reported by a primary.
    pub fn max_set_version(&self) -> Option<i32> {
        self.max_set_version
    }

    /// Highest `$clusterTime` seen from any server or reply.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Every server currently in the topology, in no particular order.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    /// Looks up one server by address.
    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Attaches `$readPreference` to a command bound for `address` when the server needs it to
    /// route the read.
    pub(crate) fn update_command_with_read_pref(
        &self,
        address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        let server_type = self
            .servers
            .get(address)
            .map_or(ServerType::Unknown, |sd| sd.server_type);
        let requested = criteria.and_then(SelectionCriteria::as_read_pref);
        let primary_preferred = || ReadPreference::PrimaryPreferred {
            options: Default::default(),
        };

        let to_send = match (self.topology_type, server_type) {
            // mongos treats a missing read preference as primary.
            (TopologyType::Sharded | TopologyType::Single, ServerType::Mongos) => {
                requested.filter(|rp| **rp != ReadPreference::Primary).cloned()
            }
            (TopologyType::Single, ServerType::Standalone) => None,
            // a direct connection to a replica set member must be allowed to read from it.
            (TopologyType::Single, _) => Some(match requested {
                None | Some(ReadPreference::Primary) => primary_preferred(),
                Some(other) => other.clone(),
            }),
            _ => match criteria {
                Some(SelectionCriteria::Predicate(_)) => Some(primary_preferred()),
                _ => requested.filter(|rp| **rp != ReadPreference::Primary).cloned(),
            },
        };
        if let Some(read_pref) = to_send {
            command.set_read_preference(&read_pref);
        }
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    fn refresh_session_timeout(&mut self, changed: &ServerDescription) {
        if !changed.server_type.is_data_bearing() {
            return;
        }
        self.logical_session_timeout =
            match (changed.logical_session_timeout(), self.logical_session_timeout) {
                (None, _) => None,
                (Some(new), Some(current)) => Some(new.min(current)),
                // `None` sorts first, so one server without a timeout keeps the result `None`.
                (Some(_), None) => self
                    .servers
                    .values()
                    .filter(|sd| sd.server_type.is_data_bearing())
                    .map(ServerDescription::logical_session_timeout)
                    .min()
                    .flatten(),
            };
    }

    /// Moves the cluster time forward. Older times are ignored.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() < Some(cluster_time) {
            self.cluster_time = Some(cluster_time.clone());
        }
    }

    /// What changed going from `self` to `other`, or `None` if nothing selection-relevant did.
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let ours: HashSet<&ServerAddress> = self.servers.keys().collect();
        let theirs: HashSet<&ServerAddress> = other.servers.keys().collect();
        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, before)| {
                let after = other.servers.get(address)?;
                (before != after).then_some((address, (before, after)))
            })
            .collect();

        Some(TopologyDescriptionDiff {
            removed_addresses: ours.difference(&theirs).copied().collect(),
            added_addresses: theirs.difference(&ours).copied().collect(),
            changed_servers,
        })
    }

    /// Folds the result of one server check into the topology.
    ///
    /// Checks of servers no longer in the topology are dropped, as are reports from primaries
    /// superseded by a newer election.
    pub(crate) fn update(&mut self, mut sd: ServerDescription) {
        if !self.servers.contains_key(&sd.address) {
            return;
        }
        if sd.server_type == ServerType::RsPrimary
            && self.set_name_matches(&sd)
            && self.is_stale_primary(&sd)
        {
            return;
        }
        if self.topology_type == TopologyType::Single && sd.is_available() {
            if let Some(expected) = self.set_name.as_deref() {
                if sd.set_name() != Some(expected) {
                    let error = set_name_mismatch(expected, &sd);
                    sd = ServerDescription::new_from_error(sd.address, error);
                }
            }
        }

        self.servers.insert(sd.address.clone(), sd.clone());
        self.refresh_session_timeout(&sd);
        if let Some(cluster_time) = sd.cluster_time() {
            self.advance_cluster_time(cluster_time);
        }
        self.apply_transition(sd);
    }

    /// Adjusts the topology type and membership for a server that just reported `sd`.
    fn apply_transition(&mut self, sd: ServerDescription) {
        use ServerType::*;

        let had_primary = self.topology_type == TopologyType::ReplicaSetWithPrimary;
        match (self.topology_type, sd.server_type) {
            (TopologyType::Single, _) => {}
            (TopologyType::Sharded, Unknown | Mongos) => {}
            (TopologyType::Sharded, _) => {
                self.servers.remove(&sd.address);
            }
            (_, Unknown | RsGhost) => {
                if had_primary {
                    self.record_primary_state();
                }
            }
            (TopologyType::Unknown, Standalone) if self.single_seed => {
                self.topology_type = TopologyType::Single;
            }
            (TopologyType::Unknown, Mongos) => self.topology_type = TopologyType::Sharded,
            (_, Standalone | Mongos) => {
                self.servers.remove(&sd.address);
                if had_primary {
                    self.record_primary_state();
                }
            }
            (_, RsPrimary) => self.apply_primary(sd),
            (TopologyType::ReplicaSetWithPrimary, _) => {
                if !self.set_name_matches(&sd) {
                    self.reject_set_name(sd);
                    self.record_primary_state();
                } else if sd.invalid_me() {
                    self.servers.remove(&sd.address);
                    self.record_primary_state();
                }
            }
            (_, _) => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                if self.set_name.is_none() {
                    self.set_name = sd.set_name().map(String::from);
                } else if !self.set_name_matches(&sd) {
                    self.reject_set_name(sd);
                    return;
                }
                self.add_new_servers(sd.known_hosts());
                if sd.invalid_me() {
                    self.servers.remove(&sd.address);
                }
            }
        }
    }

    fn apply_primary(&mut self, primary: ServerDescription) {
        if self.set_name.is_none() {
            self.set_name = primary.set_name().map(String::from);
        } else if !self.set_name_matches(&primary) {
            self.reject_set_name(primary);
            self.record_primary_state();
            return;
        }

        // stale primaries never get here, so this pair is the newest seen.
        match primary.election_id() {
            Some(election_id) => {
                self.max_election_id = Some(election_id);
                self.max_set_version = primary.set_version();
            }
            None => {
                if let Some(version) = primary.set_version() {
                    self.max_set_version = self.max_set_version.max(Some(version));
                }
            }
        }

        // an older primary still listed is reset so its next check reports its new role.
        let superseded: Vec<ServerAddress> = self
            .servers
            .values()
            .filter(|sd| sd.server_type == ServerType::RsPrimary && sd.address != primary.address)
            .map(|sd| sd.address.clone())
            .collect();
        for address in superseded {
            let unknown = ServerDescription::new(&address);
            self.servers.insert(address, unknown);
        }

        // the primary's host list is authoritative.
        let members = primary.known_hosts();
        self.add_new_servers(members.iter().cloned());
        self.servers.retain(|address, _| members.contains(address));

        self.record_primary_state();
    }

    fn set_name_matches(&self, sd: &ServerDescription) -> bool {
        self.set_name
            .as_deref()
            .is_none_or(|name| sd.set_name() == Some(name))
    }

    /// Whether a primary reports an (electionId, setVersion) pair older than the newest seen.
    fn is_stale_primary(&self, sd: &ServerDescription) -> bool {
        let reported = (sd.election_id(), sd.set_version());
        reported != (None, None) && (self.max_election_id, self.max_set_version) > reported
    }

    /// Replaces a server that belongs to another replica set with an unknown description that
    /// records why.
    fn reject_set_name(&mut self, sd: ServerDescription) {
        let error = set_name_mismatch(self.set_name.as_deref().unwrap_or_default(), &sd);
        let address = sd.address;
        self.servers.insert(
            address.clone(),
            ServerDescription::new_from_error(address, error),
        );
    }

    /// Sets the replica set type according to whether any member is currently primary.
    fn record_primary_state(&mut self) {
        let has_primary = self
            .servers
            .values()
            .any(|sd| sd.server_type == ServerType::RsPrimary);
        self.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            if !self.servers.contains_key(&address) {
                let sd = ServerDescription::new(&address);
                self.servers.insert(address, sd);
            }
        }
    }
}

fn set_name_mismatch(expected: &str, sd: &ServerDescription) -> Error {
    Error::invalid_argument(format!(
        "replica set name {:?} does not match the name {:?} reported by {}",
        expected,
        sd.set_name().unwrap_or("<none>"),
        sd.address,
    ))
}

/// The changes between two topology descriptions, as seen from the older one.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    /// Servers present in both, with their (old, new) descriptions.
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}
