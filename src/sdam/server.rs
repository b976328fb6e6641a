use std::sync::Arc;

use crate::{
    bson::oid::ObjectId,
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool},
    options::{ClientOptions, ServerAddress},
    sdam::TopologyUpdater,
};

/// A server the topology is tracking, along with its pool of connections.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,
    pub(crate) pool: ConnectionPool,
}

impl Server {
    pub(crate) fn new(
        address: ServerAddress,
        options: &ClientOptions,
        establisher: ConnectionEstablisher,
        updater: TopologyUpdater,
        topology_id: ObjectId,
    ) -> Arc<Server> {
        let pool_options = ConnectionPoolOptions::from_client_options(options);
        let pool = ConnectionPool::new(
            address.clone(),
            establisher,
            updater,
            topology_id,
            Some(pool_options),
        );
        Arc::new(Server { address, pool })
    }

    /// A server whose pool never opens connections, for selection tests.
    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress) -> Self {
        let pool = ConnectionPool::new_mocked(address.clone());
        Server { address, pool }
    }
}
