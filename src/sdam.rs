mod description;
mod monitor;
pub mod public;
mod server;
mod topology;

use std::time::Duration;

pub use self::public::{ServerType, TopologyType};

pub(crate) use self::{
    description::{
        server::ServerDescription,
        topology::{
            server_selection::SelectedServer,
            TopologyDescription,
        },
    },
    server::Server,
    topology::{
        HandshakePhase,
        Topology,
        TopologyUpdater,
        DEFAULT_SERVER_SELECTION_TIMEOUT,
    },
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
