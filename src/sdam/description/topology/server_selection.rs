
use std::{collections::HashMap, fmt, ops::Deref, sync::Arc, time::Duration};

use rand::seq::IndexedRandom;

use super::TopologyDescription;
use crate::{
    error::{Error, Result},
    operation::OperationKind,
    options::ServerAddress,
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::TopologyType,
        },
        public::ServerInfo,
        Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// How often an idle primary writes a no-op, which bounds how stale an idle secondary can look.
const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// Floor for `maxStalenessSeconds`, whatever the heartbeat frequency.
const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);

/// The server chosen for an operation. Derefs to the [`Server`] so its pool is at hand.
#[derive(Debug, Clone)]
pub(crate) struct SelectedServer(Arc<Server>);

impl SelectedServer {
    pub(crate) fn address(&self) -> &ServerAddress {
        &self.0.address
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.0
    }
}

/// Picks a server at random from the suitable servers in the latency window, or `None` if there
/// are none yet.
///
/// `deprioritized` (the server a failed first attempt ran on) is skipped unless it is the only
/// candidate.
pub(crate) fn attempt_to_select_server(
    criteria: &SelectionCriteria,
    kind: OperationKind,
    description: &TopologyDescription,
    servers: &HashMap<ServerAddress, Arc<Server>>,
    deprioritized: Option<&ServerAddress>,
) -> Result<Option<SelectedServer>> {
    let mut candidates = description.suitable_servers_in_latency_window(criteria, kind)?;
    if let Some(avoid) = deprioritized {
        if candidates.len() > 1 {
            candidates.retain(|sd| &sd.address != avoid);
        }
    }

    let live: Vec<&Arc<Server>> = candidates
        .iter()
        .filter_map(|sd| servers.get(&sd.address))
        .collect();
    Ok(live
        .choose(&mut rand::rng())
        .map(|server| SelectedServer(Arc::clone(server))))
}

/// Rejects a max staleness the client could not enforce: it has to be at least 90 seconds and
/// cover a heartbeat plus an idle write period.
pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let floor = SMALLEST_MAX_STALENESS.max(heartbeat_frequency + IDLE_WRITE_PERIOD);
    if max_staleness < floor {
        return Err(Error::invalid_argument(format!(
            "maxStalenessSeconds must be at least {} seconds, got {}",
            floor.as_secs(),
            max_staleness.as_secs()
        )));
    }
    Ok(())
}

/// What a secondary's staleness is measured against.
enum StalenessBaseline {
    /// The primary's replication lag as of its last check, in milliseconds. `None` if the
    /// primary did not report enough to tell, in which case no secondary is fresh.
    Primary { lag: Option<i64> },

    /// With no primary, the newest write any secondary has seen.
    NewestSecondaryWrite { last_write: i64 },
}

impl StalenessBaseline {
    /// Estimated staleness of `secondary` in milliseconds, or `None` if it never reported its
    /// last write.
    fn staleness_of(&self, secondary: &ServerDescription, heartbeat: i64) -> Option<i64> {
        let last_write = secondary.last_write_date()?.timestamp_millis();
        match *self {
            StalenessBaseline::Primary { lag } => {
                let lag = lag?;
                let last_update = secondary.last_update_time?.timestamp_millis();
                Some(last_update - last_write - lag + heartbeat)
            }
            StalenessBaseline::NewestSecondaryWrite {
                last_write: newest,
            } => Some(newest - last_write + heartbeat),
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.servers.values().any(ServerDescription::is_available) {
            format!(
                "Server selection timeout: no available server matches {}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            )
        }
    }

    /// The servers `criteria` allows for an operation of `kind`, narrowed to those whose
    /// average round trip time is within the local threshold of the fastest one.
    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
        kind: OperationKind,
    ) -> Result<Vec<&'a ServerDescription>> {
        let mut suitable = match criteria {
            // writes need a writable server whatever the read preference says.
            _ if kind == OperationKind::Write => self.suitable_servers(&ReadPreference::Primary)?,
            SelectionCriteria::ReadPreference(read_pref) => self.suitable_servers(read_pref)?,
            SelectionCriteria::Predicate(predicate) => {
                // a single server is selectable even when it isn't data-bearing.
                let single = self.topology_type == TopologyType::Single;
                self.servers
                    .values()
                    .filter(|sd| single || sd.server_type.is_data_bearing())
                    .filter(|sd| predicate(&ServerInfo::new(sd)))
                    .collect()
            }
        };

        let fastest = suitable
            .iter()
            .filter_map(|sd| sd.average_round_trip_time)
            .min();
        if let Some(fastest) = fastest {
            let threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);
            let cutoff = fastest.saturating_add(threshold);
            suitable.retain(|sd| sd.average_round_trip_time.is_some_and(|rtt| rtt <= cutoff));
        }
        Ok(suitable)
    }

    fn of_type(&self, server_type: ServerType) -> impl Iterator<Item = &ServerDescription> {
        self.servers
            .values()
            .filter(move |sd| sd.server_type == server_type)
    }

    fn suitable_servers(&self, read_pref: &ReadPreference) -> Result<Vec<&ServerDescription>> {
        Ok(match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single => self.servers.values().filter(|sd| sd.is_available()).collect(),
            TopologyType::Sharded => self.of_type(ServerType::Mongos).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.replica_set_members_for(read_pref)?
            }
        })
    }

    fn replica_set_members_for(
        &self,
        read_pref: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let primary: Vec<&ServerDescription> = self.of_type(ServerType::RsPrimary).collect();

        let members = match read_pref {
            ReadPreference::Primary => primary,
            ReadPreference::PrimaryPreferred { .. } if !primary.is_empty() => primary,
            ReadPreference::Secondary { .. } | ReadPreference::PrimaryPreferred { .. } => {
                self.eligible(read_pref, self.of_type(ServerType::RsSecondary).collect())?
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let secondaries =
                    self.eligible(read_pref, self.of_type(ServerType::RsSecondary).collect())?;
                if secondaries.is_empty() {
                    primary
                } else {
                    secondaries
                }
            }
            ReadPreference::Nearest { .. } => {
                let mut members: Vec<_> = self.of_type(ServerType::RsSecondary).collect();
                members.extend(primary);
                self.eligible(read_pref, members)?
            }
        };
        Ok(members)
    }

    /// Applies the read preference's max staleness and tag sets to `members`.
    fn eligible<'a>(
        &'a self,
        read_pref: &ReadPreference,
        mut members: Vec<&'a ServerDescription>,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(max_staleness) = read_pref.max_staleness() {
            verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
            self.retain_fresh(&mut members, max_staleness);
        }
        if let Some(tag_sets) = read_pref.tag_sets() {
            retain_first_matching_tag_set(&mut members, tag_sets);
        }
        Ok(members)
    }

    fn staleness_baseline(&self) -> Option<StalenessBaseline> {
        if let Some(primary) = self.of_type(ServerType::RsPrimary).next() {
            let lag = match (primary.last_update_time, primary.last_write_date()) {
                (Some(update), Some(write)) => {
                    Some(update.timestamp_millis() - write.timestamp_millis())
                }
                _ => None,
            };
            return Some(StalenessBaseline::Primary { lag });
        }
        self.of_type(ServerType::RsSecondary)
            .filter_map(|sd| sd.last_write_date())
            .map(|date| date.timestamp_millis())
            .max()
            .map(|last_write| StalenessBaseline::NewestSecondaryWrite { last_write })
    }

    fn retain_fresh(&self, members: &mut Vec<&ServerDescription>, max_staleness: Duration) {
        let Some(baseline) = self.staleness_baseline() else {
            return;
        };
        let heartbeat = millis(self.heartbeat_frequency());
        let max_staleness = millis(max_staleness);
        members.retain(|sd| {
            sd.server_type == ServerType::RsPrimary
                || baseline
                    .staleness_of(sd, heartbeat)
                    .is_some_and(|staleness| staleness <= max_staleness)
        });
    }
}

/// Keeps the members matching the first tag set that matches anyone. If none does, nothing is
/// kept. An empty list of tag sets keeps everyone.
fn retain_first_matching_tag_set(members: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }
    match tag_sets
        .iter()
        .find(|tags| members.iter().any(|sd| sd.matches_tag_set(tags)))
    {
        Some(tags) => members.retain(|sd| sd.matches_tag_set(tags)),
        None => members.clear(),
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Type: {}", self.topology_type)?;
        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }
        if let Some(version) = self.max_set_version {
            write!(f, ", Max Set Version: {}", version)?;
        }
        if let Some(election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {}", election_id)?;
        }
        if !self.servers.is_empty() {
            let servers: Vec<String> = self.servers.values().map(ToString::to_string).collect();
            write!(f, ", Servers: [ {} ]", servers.join(", "))?;
        }
        write!(f, " }}")
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Address: {}, Type: {}", self.address, self.server_type)?;
        if let Some(rtt) = self.average_round_trip_time {
            write!(f, ", Average RTT: {:?}", rtt)?;
        }
        if let Some(set_name) = self.set_name() {
            write!(f, ", Set Name: {}", set_name)?;
        }
        if self.reduced_confidence() {
            f.write_str(", Reduced Confidence")?;
        }
        if let Some(error) = self.error() {
            write!(f, ", Error: {}", error)?;
        }
        f.write_str(" }")
    }
}
