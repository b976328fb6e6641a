use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{broadcast, mpsc, watch};

use super::{
    description::topology::{server_selection, TopologyDescriptionDiff},
    monitor::Monitor,
    SelectedServer,
    Server,
    ServerDescription,
    TopologyDescription,
};
use crate::{
    bson::oid::ObjectId,
    client::session::ClusterTime,
    cmap::{
        establish::{ConnectionEstablisher, EstablisherOptions},
        Command,
        PooledConnection,
    },
    error::{Error, Result},
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    operation::OperationKind,
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    selection_criteria::SelectionCriteria,
    trace::server_selection::SelectionTrace,
    ServerType,
    TopologyType,
};

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire version of MongoDB 4.2, the first release that keeps connections open across a
/// stepdown.
const KEEPS_CONNECTIONS_ON_STEPDOWN: i32 = 8;

/// The client's live view of the deployment.
///
/// A single worker task owns the view. Monitor checks, errors seen by operations and cluster
/// time gossip all reach it as messages and are applied one at a time; after each one the
/// worker publishes a fresh [`TopologyState`]. Readers take snapshots through a
/// [`TopologyWatcher`] and never wait on the worker.
#[derive(Debug)]
pub(crate) struct Topology {
    pub(crate) id: ObjectId,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    checks: CheckRequester,
    server_selection_timeout: Duration,
    _worker: WorkerHandle,
}

impl Topology {
    /// Publishes the seed list and starts the worker and one monitor per seed. Needs a tokio
    /// runtime.
    pub(crate) fn new(options: ClientOptions) -> Topology {
        let id = ObjectId::new();
        let events = SdamEventEmitter::new(options.sdam_event_handler.clone(), id);
        events.emit_event(|| TopologyOpeningEvent { topology_id: id }.into());

        let (updater, updates) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();
        let (publisher, receiver) = watch::channel(TopologyState::default());
        let watcher = TopologyWatcher { receiver };
        let checks = CheckRequester::new();

        let worker = TopologyWorker {
            id,
            updates,
            handle_listener,
            publisher,
            checks: checks.clone(),
            establisher: ConnectionEstablisher::new(EstablisherOptions::from_client_options(
                &options,
            )),
            events,
            watcher: watcher.clone(),
            updater: updater.clone(),
            options: options.clone(),
        };
        worker.publish_seeds(TopologyDescription::new(&options));
        runtime::execute(worker.run());

        Topology {
            id,
            watcher,
            updater,
            checks,
            server_selection_timeout: options
                .server_selection_timeout
                .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT),
            _worker: worker_handle,
        }
    }

    /// False once `shutdown` has finished.
    pub(crate) fn is_alive(&self) -> bool {
        self.watcher.is_alive()
    }

    /// Asks every monitor to check its server as soon as its minimum interval allows.
    pub(crate) fn request_update(&self) {
        self.checks.request()
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher
            .borrow_latest()
            .description
            .cluster_time()
            .cloned()
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.updater.advance_cluster_time(to).await;
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.watcher.borrow_latest().description.supports_sessions()
    }

    pub(crate) fn update_command_with_read_pref(
        &self,
        address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        self.watcher
            .borrow_latest()
            .description
            .update_command_with_read_pref(address, command, criteria)
    }

    pub(crate) fn description(&self) -> TopologyDescription {
        self.watcher.borrow_latest().description.clone()
    }

    /// Finds a server for an operation of `kind`.
    ///
    /// While nothing suitable is known, every monitor is asked for an immediate check and
    /// selection is retried on each new snapshot, until the server selection timeout.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        kind: OperationKind,
        operation_name: &str,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        let deadline = Instant::now() + self.server_selection_timeout;
        let trace = SelectionTrace {
            topology_id: self.id,
            criteria,
            operation: operation_name,
            deadline,
        };

        let mut watcher = self.watcher.clone();
        let mut state = watcher.clone_latest();
        trace.started(&state.description);
        let mut announced_wait = false;

        loop {
            if !watcher.is_alive() {
                return Err(Error::shutdown());
            }

            let selected = server_selection::attempt_to_select_server(
                criteria,
                kind,
                &state.description,
                &state.servers,
                deprioritized,
            )
            .inspect_err(|error| trace.failed(&state.description, error))?;
            if let Some(server) = selected {
                trace.succeeded(server.address());
                return Ok(server);
            }

            if !announced_wait {
                trace.waiting(&state.description);
                announced_wait = true;
            }
            self.checks.request();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !watcher.wait_for_update(remaining).await {
                if !watcher.is_alive() {
                    return Err(Error::shutdown());
                }
                let message = state
                    .description
                    .server_selection_timeout_error_message(criteria);
                let error = Error::server_selection(message, Some(state.description.clone()));
                trace.failed(&state.description, &error);
                return Err(error);
            }
            state = watcher.clone_latest();
        }
    }

    /// Stops the worker, which stops every monitor. Pools close once their checked-out
    /// connections come back.
    pub(crate) async fn shutdown(&self) {
        self.updater.send(TopologyUpdate::Shutdown).await;
    }

    #[cfg(test)]
    pub(crate) fn servers(&self) -> HashMap<ServerAddress, Arc<Server>> {
        self.watcher.borrow_latest().servers.clone()
    }
}

/// One published snapshot: the description and the servers (with their pools) it lists.
#[derive(Debug, Clone, Default)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

#[derive(Debug)]
pub(crate) enum TopologyUpdate {
    ServerChecked(Box<ServerDescription>),
    CheckFailed {
        address: ServerAddress,
        error: Error,
        consecutive_failures: u32,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    ClusterTime(ClusterTime),
    Shutdown,
}

pub(crate) type UpdateReceiver = mpsc::UnboundedReceiver<AcknowledgedMessage<TopologyUpdate, bool>>;

/// What an error seen by an operation does to the server it came from.
#[derive(Debug, PartialEq, Eq)]
enum ErrorResponse {
    /// The error says nothing about the server.
    Ignore,

    /// Mark the server unknown. `clear_pool` drops its connections too. `recheck` asks the
    /// monitors for an immediate check, since the server is probably still up.
    MarkUnknown { clear_pool: bool, recheck: bool },
}

impl ErrorResponse {
    fn for_error(error: &Error, phase: &HandshakePhase) -> Self {
        if error.is_state_change_error() {
            let connections_closed = error.is_shutting_down()
                || phase
                    .wire_version()
                    .is_none_or(|version| version < KEEPS_CONNECTIONS_ON_STEPDOWN);
            return Self::MarkUnknown {
                clear_pool: connections_closed,
                recheck: true,
            };
        }

        let failed_during_handshake = phase.is_before_completion()
            && (error.is_auth_error() || error.is_network_timeout() || error.is_server_error());
        if error.is_non_timeout_network_error() || failed_during_handshake {
            Self::MarkUnknown {
                clear_pool: true,
                recheck: false,
            }
        } else {
            Self::Ignore
        }
    }
}

struct TopologyWorker {
    id: ObjectId,
    updates: UpdateReceiver,
    handle_listener: WorkerHandleListener,
    publisher: watch::Sender<TopologyState>,
    checks: CheckRequester,
    establisher: ConnectionEstablisher,
    events: SdamEventEmitter,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    options: ClientOptions,
}

impl TopologyWorker {
    fn latest(&self) -> TopologyState {
        self.publisher.borrow().clone()
    }

    fn publish(&self, state: TopologyState) {
        self.publisher.send_replace(state);
    }

    fn publish_seeds(&self, description: TopologyDescription) {
        let mut state = self.latest();
        let previous = std::mem::replace(&mut state.description, description);
        let added = self.sync_servers(&mut state);
        self.emit_changes(&previous, &state.description);
        self.publish(state);
        self.start_monitors(added);
    }

    async fn run(mut self) {
        let mut shutdown_ack = None;
        loop {
            tokio::select! {
                Some(message) = self.updates.recv() => {
                    let (update, ack) = message.into_parts();
                    let changed = match update {
                        TopologyUpdate::ServerChecked(sd) => self.apply(*sd).await,
                        TopologyUpdate::CheckFailed { address, error, consecutive_failures } => {
                            self.check_failed(address, error, consecutive_failures).await
                        }
                        TopologyUpdate::ApplicationError { address, error, phase } => {
                            self.application_error(address, error, phase).await
                        }
                        TopologyUpdate::ClusterTime(to) => {
                            let mut state = self.latest();
                            state.description.advance_cluster_time(&to);
                            self.publish(state);
                            true
                        }
                        TopologyUpdate::Shutdown => {
                            shutdown_ack = Some(ack);
                            break;
                        }
                    };
                    ack.acknowledge(changed);
                }
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                else => break,
            }
        }

        self.close();
        if let Some(ack) = shutdown_ack {
            ack.acknowledge(true);
        }
    }

    /// Publishes an empty server list and reports every server and then the topology as
    /// closed. Dropping the publisher afterwards tells watchers and monitors to stop.
    fn close(self) {
        let mut state = self.latest();
        let closed: Vec<ServerAddress> = state.servers.drain().map(|(address, _)| address).collect();
        self.publish(state);

        let topology_id = self.id;
        for address in closed {
            self.events.emit_event(|| {
                ServerClosedEvent {
                    topology_id,
                    address,
                }
                .into()
            });
        }
        self.events
            .emit_event(|| TopologyClosedEvent { topology_id }.into());
    }

    /// Makes the servers in `state` match the addresses its description lists, creating a pool
    /// for each new one. Returns the new addresses, whose monitors must only be started once
    /// `state` is published: a monitor stops as soon as it finds its server missing.
    fn sync_servers(&self, state: &mut TopologyState) -> Vec<ServerAddress> {
        let listed: HashSet<ServerAddress> = state.description.server_addresses().cloned().collect();
        state.servers.retain(|address, _| listed.contains(address));

        let mut added = Vec::new();
        for address in listed {
            if state.servers.contains_key(&address) {
                continue;
            }
            let server = Server::new(
                address.clone(),
                &self.options,
                self.establisher.clone(),
                self.updater.clone(),
                self.id,
            );
            state.servers.insert(address.clone(), server);
            added.push(address);
        }
        added
    }

    fn start_monitors(&self, addresses: Vec<ServerAddress>) {
        if !self.monitoring_enabled() {
            return;
        }
        for address in addresses {
            Monitor::start(
                address,
                self.updater.clone(),
                self.watcher.clone(),
                self.checks.subscribe(),
                self.establisher.clone(),
                self.events.clone(),
                &self.options,
            );
        }
    }

    #[cfg(test)]
    fn monitoring_enabled(&self) -> bool {
        !self
            .options
            .test_options
            .as_ref()
            .is_some_and(|options| options.disable_monitoring_threads)
    }

    #[cfg(not(test))]
    fn monitoring_enabled(&self) -> bool {
        true
    }

    /// Folds `sd` into the topology and publishes the result, which happens even when nothing
    /// selection-relevant changed so new round trip times are seen. Returns whether the
    /// description changed.
    async fn apply(&mut self, sd: ServerDescription) -> bool {
        let address = sd.address.clone();
        let mut state = self.latest();
        let previous = state.description.clone();

        state.description.update(sd);
        let added = self.sync_servers(&mut state);
        let changed = self.emit_changes(&previous, &state.description);

        // a server that answered as something usable can hand out connections again.
        let server_type = state
            .description
            .server(&address)
            .map_or(ServerType::Unknown, |sd| sd.server_type);
        let usable = server_type.is_data_bearing()
            || (server_type != ServerType::Unknown
                && state.description.topology_type() == TopologyType::Single);
        if usable {
            if let Some(server) = state.servers.get(&address) {
                server.pool.mark_as_ready().await;
            }
        }

        self.publish(state);
        self.start_monitors(added);
        changed
    }

    /// Emits the SDAM events for going from `previous` to `current`. Returns whether anything
    /// changed.
    fn emit_changes(&self, previous: &TopologyDescription, current: &TopologyDescription) -> bool {
        let Some(TopologyDescriptionDiff {
            removed_addresses,
            added_addresses,
            changed_servers,
        }) = previous.diff(current)
        else {
            return false;
        };
        let topology_id = self.id;

        for (address, (before, after)) in changed_servers {
            self.events.emit_event(|| {
                SdamEvent::ServerDescriptionChanged(Box::new(ServerDescriptionChangedEvent {
                    topology_id,
                    address: address.clone(),
                    previous_description: before.clone(),
                    new_description: after.clone(),
                }))
            });
        }
        for address in removed_addresses {
            self.events.emit_event(|| {
                ServerClosedEvent {
                    topology_id,
                    address: address.clone(),
                }
                .into()
            });
        }
        for address in added_addresses {
            self.events.emit_event(|| {
                ServerOpeningEvent {
                    topology_id,
                    address: address.clone(),
                }
                .into()
            });
        }
        self.events.emit_event(|| {
            SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                topology_id,
                previous_description: previous.clone(),
                new_description: current.clone(),
            }))
        });
        true
    }

    fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.publisher.borrow().servers.get(address).cloned()
    }

    /// Marks the server unknown because of `error` and clears its pool if that changed the
    /// topology.
    async fn mark_unknown(
        &mut self,
        server: &Server,
        error: Error,
        consecutive_failures: u32,
        clear_pool: bool,
    ) -> bool {
        let mut unknown = ServerDescription::new_from_error(server.address.clone(), error.clone());
        unknown.consecutive_failures = consecutive_failures;
        let changed = self.apply(unknown).await;
        if changed && clear_pool {
            server.pool.clear(error).await;
        }
        changed
    }

    async fn check_failed(
        &mut self,
        address: ServerAddress,
        error: Error,
        consecutive_failures: u32,
    ) -> bool {
        match self.server(&address) {
            Some(server) => {
                self.mark_unknown(&server, error, consecutive_failures, true)
                    .await
            }
            None => false,
        }
    }

    async fn application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let Some(server) = self.server(&address) else {
            return false;
        };
        // the pool was cleared since this connection was made, so the error is old news.
        if phase.generation() < server.pool.generation() {
            return false;
        }

        match ErrorResponse::for_error(&error, &phase) {
            ErrorResponse::Ignore => false,
            ErrorResponse::MarkUnknown {
                clear_pool,
                recheck,
            } => {
                let changed = self.mark_unknown(&server, error, 0, clear_pool).await;
                if recheck {
                    self.checks.request();
                }
                changed
            }
        }
    }
}

/// Sends updates to the topology worker. Each send waits until the update is applied and
/// returns whether it changed the topology.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<AcknowledgedMessage<TopologyUpdate, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, UpdateReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (TopologyUpdater { sender }, receiver)
    }

    async fn send(&self, update: TopologyUpdate) -> bool {
        let (message, ack) = AcknowledgedMessage::package(update);
        if self.sender.send(message).is_err() {
            return false;
        }
        ack.wait_for_acknowledgment().await.unwrap_or(false)
    }

    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send(TopologyUpdate::ServerChecked(Box::new(sd))).await
    }

    pub(crate) async fn handle_monitor_error(
        &self,
        address: ServerAddress,
        error: Error,
        consecutive_failures: u32,
    ) -> bool {
        self.send(TopologyUpdate::CheckFailed {
            address,
            error,
            consecutive_failures,
        })
        .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send(TopologyUpdate::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.send(TopologyUpdate::ClusterTime(to)).await;
    }
}

/// Reads the snapshots the topology worker publishes.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    /// Whether the worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .server(address)
            .cloned()
    }

    /// The latest snapshot, which is then considered seen.
    pub(crate) fn clone_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Waits up to `timeout` for a snapshot newer than the last one seen. False if none came or
    /// the worker stopped.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return false;
        }
        matches!(
            runtime::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }

    /// Resolves once `address` is gone from the topology or the worker has stopped.
    pub(crate) async fn wait_until_removed(&mut self, address: &ServerAddress) {
        while self.receiver.changed().await.is_ok() {
            if !self.receiver.borrow().servers.contains_key(address) {
                return;
            }
        }
    }

    pub(crate) fn borrow_latest(&self) -> watch::Ref<'_, TopologyState> {
        self.receiver.borrow()
    }
}

/// Fans requests for an immediate check out to every monitor.
#[derive(Clone, Debug)]
struct CheckRequester {
    sender: broadcast::Sender<()>,
}

impl CheckRequester {
    fn new() -> Self {
        // one pending request is as good as many.
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    fn request(&self) {
        let _ = self.sender.send(());
    }

    fn subscribe(&self) -> CheckRequests {
        CheckRequests(self.sender.subscribe())
    }
}

/// A monitor's end of the [`CheckRequester`].
pub(crate) struct CheckRequests(broadcast::Receiver<()>);

impl CheckRequests {
    /// Waits up to `timeout` for someone to ask for a check.
    pub(crate) async fn wait(&mut self, timeout: Duration) {
        let _ = runtime::timeout(timeout, self.0.recv()).await;
    }

    /// Forgets requests made before now, which the check about to start satisfies.
    pub(crate) fn clear(&mut self) {
        while self.0.try_recv().is_ok() {}
    }
}

/// How far the connection an error came from had got through its handshake. Errors are judged
/// differently depending on it.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// Before the hello reply, e.g. while connecting.
    PreHello { generation: u32 },

    /// After the hello reply but before authentication finished.
    PostHello { generation: u32 },

    /// On an established connection.
    AfterCompletion {
        generation: u32,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(connection: &PooledConnection) -> Self {
        let max_wire_version = connection
            .stream_description()
            .ok()
            .and_then(|description| description.max_wire_version)
            .unwrap_or(0);
        Self::AfterCompletion {
            generation: connection.generation,
            max_wire_version,
        }
    }

    /// The pool generation the connection was created in.
    pub(crate) fn generation(&self) -> u32 {
        match *self {
            Self::PreHello { generation }
            | Self::PostHello { generation }
            | Self::AfterCompletion { generation, .. } => generation,
        }
    }

    fn is_before_completion(&self) -> bool {
        !matches!(self, Self::AfterCompletion { .. })
    }

    fn wire_version(&self) -> Option<i32> {
        match *self {
            Self::AfterCompletion {
                max_wire_version, ..
            } => Some(max_wire_version),
            _ => None,
        }
    }
}
