
pub(crate) mod conn;
pub(crate) mod establish;
pub(crate) mod options;
mod requests;
mod worker;

use std::time::{Duration, Instant};

use derive_where::derive_where;
use tokio::sync::watch;

use self::{
    establish::ConnectionEstablisher,
    options::ConnectionPoolOptions,
    requests::{Checkout, CheckoutRequester, PoolManager},
    worker::PoolWorker,
};
pub(crate) use self::conn::{
    pooled::PooledConnection,
    Command,
    CommandResponse,
    Connection,
    StreamDescription,
};
use crate::{
    bson::oid::ObjectId,
    error::{Error, ErrorKind, Result},
    event::cmap::{
        CmapEvent,
        CmapEventEmitter,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        PoolCreatedEvent,
    },
    options::ServerAddress,
    runtime,
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A handle to the connections kept for a single server.
///
/// Clones share one background worker, which closes its idle connections and stops once the last
/// handle is dropped.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    requester: CheckoutRequester,
    generation: watch::Receiver<u32>,
    wait_queue_timeout: Option<Duration>,

    #[derive_where(skip)]
    events: CmapEventEmitter,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        topology_id: ObjectId,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let events = CmapEventEmitter::new(
            options.as_ref().and_then(|o| o.cmap_event_handler.clone()),
            topology_id,
        );
        let (manager, requester, generation) = PoolWorker::spawn(
            address.clone(),
            establisher,
            server_updater,
            events.clone(),
            options.as_ref(),
        );

        events.emit_event(|| {
            CmapEvent::PoolCreated(PoolCreatedEvent {
                address: address.clone(),
                options: options.as_ref().map(ConnectionPoolOptions::to_event_options),
            })
        });

        Self {
            address,
            manager,
            requester,
            generation,
            wait_queue_timeout: options
                .and_then(|o| o.wait_queue_timeout)
                .filter(|t| !t.is_zero()),
            events,
        }
    }

    /// A pool with no worker behind it, for tests that only need a [`Server`](crate::sdam::Server).
    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress) -> Self {
        let (requester, _) = CheckoutRequester::new(crate::runtime::WorkerHandle::new_mocked());
        Self {
            address,
            manager: PoolManager::new().0,
            requester,
            generation: watch::channel(0).1,
            wait_queue_timeout: None,
            events: CmapEventEmitter::new(None, ObjectId::new()),
        }
    }

    /// Waits in the pool's queue for a connection, opening a new one if the pool is below its
    /// maximum size.
    ///
    /// Fails with [`ErrorKind::WaitQueueTimeout`] if the configured wait queue timeout elapses
    /// first, and with a pool-cleared error if the pool is paused.
    pub(crate) async fn check_out(&self) -> Result<PooledConnection> {
        let started = Instant::now();
        self.events.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let checkout = match self.wait_queue_timeout {
            None => self.requester.request().await,
            Some(limit) => match runtime::timeout(limit, self.requester.request()).await {
                Ok(checkout) => checkout,
                Err(_) => {
                    self.checkout_failed(ConnectionCheckoutFailedReason::Timeout, started);
                    return Err(ErrorKind::WaitQueueTimeout {
                        address: self.address.clone(),
                    }
                    .into());
                }
            },
        };

        let result = match checkout {
            Checkout::Idle(connection) => Ok(*connection),
            Checkout::Opening(establishment) => establishment.await,
            Checkout::Rejected(error) => Err(error),
        };
        match result {
            Ok(ref connection) => connection.emit_checked_out(started),
            Err(_) => self.checkout_failed(ConnectionCheckoutFailedReason::ConnectionError, started),
        }
        result
    }

    fn checkout_failed(&self, reason: ConnectionCheckoutFailedReason, started: Instant) {
        self.events.emit_event(|| {
            ConnectionCheckoutFailedEvent {
                address: self.address.clone(),
                reason,
                duration: started.elapsed(),
            }
            .into()
        });
    }

    /// Bumps the generation and pauses the pool. Idle connections close now and checked-out ones
    /// close when they come back.
    pub(crate) async fn clear(&self, cause: Error) {
        self.manager.clear(cause).await
    }

    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().await
    }

    pub(crate) fn generation(&self) -> u32 {
        *self.generation.borrow()
    }
}
