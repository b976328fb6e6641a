use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc::UnboundedReceiver, watch};

use super::{
    conn::{pooled::PooledConnection, PendingConnection},
    establish::{ConnectionEstablisher, EstablishError},
    options::ConnectionPoolOptions,
    requests::{
        Checkout,
        CheckoutRequest,
        CheckoutRequester,
        Opened,
        PoolCommand,
        PoolManager,
    },
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    error::{Error, Result},
    event::cmap::{
        CmapEvent,
        CmapEventEmitter,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::ServerAddress,
    runtime::{self, AsyncJoinHandle, WorkerHandleListener},
    sdam::TopologyUpdater,
};

/// Upper bound on handshakes in flight at once.
const MAX_CONNECTING: u32 = 2;
const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// Size and lifetime bounds applied by the worker.
#[derive(Debug)]
struct PoolLimits {
    /// Zero means unbounded.
    max_size: u32,
    min_size: u32,
    max_idle_time: Option<Duration>,
}

impl PoolLimits {
    fn new(options: Option<&ConnectionPoolOptions>) -> Self {
        Self {
            max_size: options
                .and_then(|o| o.max_pool_size)
                .unwrap_or(DEFAULT_MAX_POOL_SIZE),
            min_size: options.and_then(|o| o.min_pool_size).unwrap_or(0),
            max_idle_time: options
                .and_then(|o| o.max_idle_time)
                .filter(|t| !t.is_zero()),
        }
    }
}

#[derive(Debug)]
enum PoolState {
    /// Checkouts fail with the stored cause and no background connections are opened.
    Paused(Error),
    Ready,
}

/// Everything a spawned establishment needs, detached from the worker.
#[derive(Clone, Debug)]
struct Opener {
    establisher: ConnectionEstablisher,
    server_updater: TopologyUpdater,
    manager: PoolManager,
    events: CmapEventEmitter,
}

impl Opener {
    /// Handshakes `pending`. A failure is reported to the topology and to the worker.
    async fn open(&self, pending: PendingConnection) -> Result<PooledConnection> {
        let id = pending.id;
        let address = pending.address.clone();
        match self.establisher.establish_connection(pending).await {
            Ok(connection) => {
                connection.emit_ready();
                Ok(connection)
            }
            Err(EstablishError {
                cause,
                handshake_phase,
            }) => {
                self.events.emit_event(|| {
                    CmapEvent::ConnectionClosed(ConnectionClosedEvent {
                        address: address.clone(),
                        connection_id: id,
                        reason: ConnectionClosedReason::Error,
                        error: Some(cause.clone()),
                    })
                });
                self.server_updater
                    .handle_application_error(address, cause.clone(), handshake_phase)
                    .await;
                self.manager.open_failed();
                Err(cause)
            }
        }
    }
}

/// The task that owns a pool's connections. Handles talk to it over channels and it stops once
/// the last [`CheckoutRequester`] is dropped.
#[derive(Debug)]
pub(super) struct PoolWorker {
    address: ServerAddress,
    state: PoolState,
    limits: PoolLimits,

    generation: u32,
    generation_publisher: watch::Sender<u32>,

    /// Connections in existence, counting ones checked out or still handshaking.
    total: u32,
    /// Connections still handshaking.
    opening: u32,
    next_id: u32,

    /// Checked-in connections. The front has been idle the longest.
    idle: VecDeque<PooledConnection>,
    wait_queue: VecDeque<CheckoutRequest>,

    opener: Opener,
    maintenance_frequency: Duration,

    checkouts: UnboundedReceiver<CheckoutRequest>,
    commands: UnboundedReceiver<PoolCommand>,
    handles: WorkerHandleListener,
}

impl PoolWorker {
    /// Spawns the worker for the pool at `address`.
    pub(super) fn spawn(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        events: CmapEventEmitter,
        options: Option<&ConnectionPoolOptions>,
    ) -> (PoolManager, CheckoutRequester, watch::Receiver<u32>) {
        let (handle, handles) = WorkerHandleListener::channel();
        let (requester, checkouts) = CheckoutRequester::new(handle);
        let (manager, commands) = PoolManager::new();
        let (generation_publisher, generation) = watch::channel(0);

        // a pool waits for its server's monitor to find the server reachable.
        let paused = PoolState::Paused(Error::internal(
            "the pool has not been marked ready by its monitor yet",
        ));
        #[cfg(test)]
        let (state, maintenance_frequency) = test_overrides(options, paused);
        #[cfg(not(test))]
        let (state, maintenance_frequency) = (paused, MAINTENANCE_FREQUENCY);

        let worker = PoolWorker {
            address,
            state,
            limits: PoolLimits::new(options),
            generation: 0,
            generation_publisher,
            total: 0,
            opening: 0,
            next_id: 1,
            idle: VecDeque::new(),
            wait_queue: VecDeque::new(),
            opener: Opener {
                establisher,
                server_updater,
                manager: manager.clone(),
                events,
            },
            maintenance_frequency,
            checkouts,
            commands,
            handles,
        };
        runtime::execute(worker.run());

        (manager, requester, generation)
    }

    async fn run(mut self) {
        let mut maintenance = runtime::interval(self.maintenance_frequency);
        loop {
            tokio::select! {
                Some(request) = self.checkouts.recv() => self.enqueue(request),
                Some(command) = self.commands.recv() => self.handle(command),
                _ = self.handles.wait_for_all_handle_drops() => break,
                _ = maintenance.tick() => self.perform_maintenance(),
                else => break,
            }
            self.serve_wait_queue();
        }

        for connection in self.idle.drain(..) {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }
        let address = self.address.clone();
        self.opener
            .events
            .emit_event(|| CmapEvent::PoolClosed(PoolClosedEvent { address }));
    }

    fn enqueue(&mut self, request: CheckoutRequest) {
        match self.state {
            PoolState::Ready => self.wait_queue.push_back(request),
            PoolState::Paused(ref cause) => {
                let error = Error::pool_cleared_error(&self.address, cause);
                request.answer(Checkout::Rejected(error));
            }
        }
    }

    fn handle(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::CheckIn(connection) => self.check_in(*connection),
            PoolCommand::Clear(message) => {
                let (cause, done) = message.into_parts();
                self.clear(cause);
                done.acknowledge(());
            }
            PoolCommand::MarkReady(message) => {
                self.mark_as_ready();
                message.acknowledge(());
            }
            PoolCommand::Opened(opened) => {
                self.opening -= 1;
                if let Opened::ForPool(connection) = opened {
                    if connection.is_stale(self.generation) {
                        self.close(*connection, ConnectionClosedReason::Stale);
                    } else {
                        self.make_idle(*connection);
                    }
                }
            }
            PoolCommand::OpenFailed => {
                self.opening -= 1;
                self.total -= 1;
            }
        }
    }

    /// Hands out connections to queued checkouts for as long as the pool can.
    fn serve_wait_queue(&mut self) {
        while matches!(self.state, PoolState::Ready) {
            let Some(request) = self.wait_queue.pop_front() else {
                return;
            };
            if request.is_abandoned() {
                continue;
            }

            if let Some(mut connection) = self.take_idle() {
                connection.mark_as_in_use(self.opener.manager.clone());
                if let Some(unclaimed) = request.answer(Checkout::Idle(Box::new(connection))) {
                    self.make_idle(unclaimed);
                }
            } else if self.can_open() {
                let opening = self.open_for_checkout();
                // if the checkout gave up, the new connection is checked in once it is ready.
                request.answer(Checkout::Opening(opening));
            } else {
                self.wait_queue.push_front(request);
                return;
            }
        }
    }

    /// Pops the most recently used idle connection, closing any that are no longer usable.
    fn take_idle(&mut self) -> Option<PooledConnection> {
        while let Some(connection) = self.idle.pop_back() {
            if connection.is_stale(self.generation) {
                self.close(connection, ConnectionClosedReason::Stale);
            } else if connection.is_idle(self.limits.max_idle_time) {
                self.close(connection, ConnectionClosedReason::Idle);
            } else {
                return Some(connection);
            }
        }
        None
    }

    fn make_idle(&mut self, mut connection: PooledConnection) {
        connection.mark_as_available();
        self.idle.push_back(connection);
    }

    fn can_open(&self) -> bool {
        let below_max = self.limits.max_size == 0 || self.total < self.limits.max_size;
        below_max && self.opening < MAX_CONNECTING
    }

    fn next_pending(&mut self) -> PendingConnection {
        self.total += 1;
        self.opening += 1;
        let pending = PendingConnection {
            id: self.next_id,
            address: self.address.clone(),
            generation: self.generation,
            event_emitter: self.opener.events.clone(),
            time_created: Instant::now(),
        };
        self.next_id += 1;
        self.opener
            .events
            .emit_event(|| pending.created_event().into());
        pending
    }

    fn open_for_checkout(&mut self) -> AsyncJoinHandle<Result<PooledConnection>> {
        let pending = self.next_pending();
        let opener = self.opener.clone();
        runtime::spawn(async move {
            let mut connection = opener.open(pending).await?;
            connection.mark_as_in_use(opener.manager.clone());
            opener.manager.opened(Opened::HandedOut);
            Ok(connection)
        })
    }

    fn open_for_pool(&mut self) {
        let pending = self.next_pending();
        let opener = self.opener.clone();
        runtime::execute(async move {
            if let Ok(connection) = opener.open(pending).await {
                opener
                    .manager
                    .opened(Opened::ForPool(Box::new(connection)));
            }
        });
    }

    fn check_in(&mut self, connection: PooledConnection) {
        connection.emit_checked_in();

        let reason = if connection.has_errored() {
            ConnectionClosedReason::Error
        } else if connection.is_stale(self.generation) {
            ConnectionClosedReason::Stale
        } else if connection.is_executing() {
            // a reply to the abandoned command may still arrive on this stream.
            ConnectionClosedReason::Dropped
        } else {
            self.make_idle(connection);
            return;
        };
        self.close(connection, reason);
    }

    fn clear(&mut self, cause: Error) {
        self.generation += 1;
        self.generation_publisher.send_replace(self.generation);

        for connection in std::mem::take(&mut self.idle) {
            self.close(connection, ConnectionClosedReason::Stale);
        }

        let previous = std::mem::replace(&mut self.state, PoolState::Paused(cause.clone()));
        if !matches!(previous, PoolState::Ready) {
            return;
        }

        let (address, generation) = (self.address.clone(), self.generation);
        self.opener.events.emit_event(|| {
            CmapEvent::PoolCleared(PoolClearedEvent {
                address,
                generation,
            })
        });

        let error = Error::pool_cleared_error(&self.address, &cause);
        for request in self.wait_queue.drain(..) {
            request.answer(Checkout::Rejected(error.clone()));
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }
        self.state = PoolState::Ready;
        let address = self.address.clone();
        self.opener
            .events
            .emit_event(|| CmapEvent::PoolReady(PoolReadyEvent { address }));
    }

    fn close(&mut self, connection: PooledConnection, reason: ConnectionClosedReason) {
        connection.close_and_drop(reason);
        self.total -= 1;
    }

    /// Drops perished idle connections and, while ready, tops the pool up to its minimum size.
    fn perform_maintenance(&mut self) {
        while let Some(oldest) = self.idle.front() {
            let reason = if oldest.is_stale(self.generation) {
                ConnectionClosedReason::Stale
            } else if oldest.is_idle(self.limits.max_idle_time) {
                ConnectionClosedReason::Idle
            } else {
                break;
            };
            if let Some(oldest) = self.idle.pop_front() {
                self.close(oldest, reason);
            }
        }

        if matches!(self.state, PoolState::Ready) {
            while self.total < self.limits.min_size && self.opening < MAX_CONNECTING {
                self.open_for_pool();
            }
        }
    }
}

#[cfg(test)]
fn test_overrides(
    options: Option<&ConnectionPoolOptions>,
    paused: PoolState,
) -> (PoolState, Duration) {
    let state = match options.and_then(|o| o.ready) {
        Some(true) => PoolState::Ready,
        _ => paused,
    };
    let frequency = options
        .and_then(|o| o.maintenance_frequency)
        .unwrap_or(MAINTENANCE_FREQUENCY);
    (state, frequency)
}
