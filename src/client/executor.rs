use std::time::Instant;

use super::{session::ClientSession, Client};
use crate::{
    bson::Timestamp,
    cmap::{conn::wire::next_request_id, PooledConnection},
    error::{Error, Result, RETRYABLE_WRITE_ERROR},
    event::command::{
        CommandEvent,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
    },
    operation::{Operation, OperationKind, Retryability},
    options::ServerAddress,
    runtime,
    sdam::HandshakePhase,
    selection_criteria::{ReadPreference, SelectionCriteria},
    trace::{self, COMMAND_TRACING_EVENT_TARGET},
    ClusterTime,
};

/// The state kept between the first attempt of an operation and its single retry.
#[derive(Debug)]
struct ExecutionRetry {
    first_error: Error,
    first_server: ServerAddress,
}

impl Client {
    /// Execute the given operation.
    ///
    /// Server selection is performed using the criteria specified on the operation, falling back
    /// to the client's default and then to the primary. Retryable reads and writes are attempted
    /// at most twice.
    pub(crate) async fn execute_operation<'s, T: Operation>(
        &self,
        op: T,
        session: impl Into<Option<&'s mut ClientSession>>,
    ) -> Result<T::Output> {
        self.execute_operation_with_deadline(op, session, None)
            .await
    }

    pub(crate) async fn execute_operation_with_deadline<'s, T: Operation>(
        &self,
        mut op: T,
        session: impl Into<Option<&'s mut ClientSession>>,
        deadline: Option<Instant>,
    ) -> Result<T::Output> {
        if self.is_shut_down() {
            return Err(Error::shutdown());
        }

        let explicit_session: Option<&mut ClientSession> = session.into();
        let mut implicit_session = (explicit_session.is_none() && op.supports_sessions())
            .then(|| ClientSession::new(true));
        let mut session = explicit_session.or(implicit_session.as_mut());

        let criteria = op
            .selection_criteria()
            .or_else(|| self.selection_criteria())
            .cloned()
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));

        let mut retry: Option<ExecutionRetry> = None;
        let mut txn_number: Option<i64> = None;

        loop {
            if deadline_passed(deadline) {
                if let Some(retry) = retry.take() {
                    return Err(Error::network_timeout().with_source(retry.first_error));
                }
            }

            let selection = self.inner.topology.select_server(
                &criteria,
                op.kind(),
                op.name(),
                retry.as_ref().map(|r| &r.first_server),
            );
            let server = match with_deadline(deadline, selection).await {
                Ok(server) => server,
                Err(error) => return Err(first_error_or(retry, error, deadline)),
            };

            let mut conn = match with_deadline(deadline, server.pool.check_out()).await {
                Ok(conn) => conn,
                Err(mut error) => {
                    let retryability = self.retryability_before_checkout(&op, session.is_some());
                    let retryable = match retryability {
                        Retryability::Read => error.is_read_retryable(),
                        Retryability::Write => {
                            if error.should_add_retryable_write_label() {
                                error.add_label(RETRYABLE_WRITE_ERROR);
                            }
                            error.is_write_retryable()
                        }
                        Retryability::None => false,
                    };
                    if retry.is_none() && (retryable || error.is_pool_cleared()) {
                        retry = Some(ExecutionRetry {
                            first_error: error,
                            first_server: server.address.clone(),
                        });
                        continue;
                    }
                    return Err(first_error_or(retry, error, deadline));
                }
            };

            let retryability = self.retryability(&op, &conn, session.is_some());
            let txn_number = match (retryability, session.as_deref_mut()) {
                // a retried write reuses the transaction number of its first attempt.
                (Retryability::Write, Some(session)) => Some(
                    *txn_number.get_or_insert_with(|| session.get_and_increment_txn_number()),
                ),
                _ => None,
            };

            let result = self
                .execute_on_connection(
                    &mut op,
                    &mut conn,
                    session.as_deref_mut(),
                    txn_number,
                    &criteria,
                    deadline,
                )
                .await;

            let mut error = match result {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };

            if retryability == Retryability::Write && error.should_add_retryable_write_label() {
                error.add_label(RETRYABLE_WRITE_ERROR);
            }

            let retryable = match retryability {
                Retryability::Read => error.is_read_retryable(),
                Retryability::Write => error.is_write_retryable(),
                Retryability::None => false,
            };

            if retry.is_none() && retryable {
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    operation = op.name(),
                    server = %server.address,
                    error = %trace::failure(&error),
                    "Retrying operation once"
                );
                retry = Some(ExecutionRetry {
                    first_error: error,
                    first_server: server.address.clone(),
                });
                continue;
            }

            return Err(error);
        }
    }

    /// Runs one attempt of `op` over `connection`, reporting errors to the topology and
    /// gossiping cluster times into it and the session.
    async fn execute_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut PooledConnection,
        mut session: Option<&mut ClientSession>,
        txn_number: Option<i64>,
        criteria: &SelectionCriteria,
        deadline: Option<Instant>,
    ) -> Result<T::Output> {
        let stream_description = connection.stream_description()?.clone();
        let mut cmd = op.build(&stream_description)?;

        let command_criteria = match op.kind() {
            OperationKind::Write => None,
            _ => Some(criteria),
        };
        self.inner.topology.update_command_with_read_pref(
            connection.address(),
            &mut cmd,
            command_criteria,
        );

        // servers without session support reject commands that carry an lsid.
        if !(op.supports_sessions() && stream_description.supports_sessions()) {
            session = None;
        }

        if let Some(session) = session.as_deref_mut() {
            cmd.set_session(session);
            if let Some(txn_number) = txn_number {
                cmd.set_txn_number(txn_number);
            }
            if !session.is_implicit() && op.supports_read_concern() {
                if let Some(operation_time) = session.operation_time() {
                    cmd.set_after_cluster_time(operation_time);
                }
            }
            session.update_last_use();
        }

        let session_cluster_time = session.as_deref().and_then(ClientSession::cluster_time);
        let cluster_time = match (self.inner.topology.cluster_time(), session_cluster_time) {
            (Some(topology_time), Some(session_time)) => {
                Some(std::cmp::max(topology_time, session_time.clone()))
            }
            (topology_time, session_time) => topology_time.or_else(|| session_time.cloned()),
        };
        if let Some(ref cluster_time) = cluster_time {
            cmd.set_cluster_time(cluster_time);
        }

        let connection_info = connection.info();
        let request_id = next_request_id();
        let command_name = cmd.name.clone();
        let session_id = session.as_deref().map(|session| session.id().clone());

        self.emit_command_event(|| {
            CommandEvent::Started(CommandStartedEvent {
                command: cmd.body.clone(),
                db: cmd.target_db.clone(),
                command_name: command_name.clone(),
                request_id,
                connection: connection_info.clone(),
                session_id,
            })
        });

        let start_time = Instant::now();
        let send_result = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let send = connection.send_command_with_id(cmd, request_id);
                let timed = runtime::timeout(remaining, send).await;
                match timed {
                    Ok(result) => result,
                    Err(_) => {
                        // the reply may still arrive, so the connection cannot be reused.
                        connection.mark_as_errored(Error::network_timeout());
                        Err(Error::network_timeout())
                    }
                }
            }
            None => connection.send_command_with_id(cmd, request_id).await,
        };
        let duration = start_time.elapsed();

        let result = match send_result {
            Ok(response) => {
                self.gossip_times(
                    response.cluster_time(),
                    response.operation_time(),
                    session.as_deref_mut(),
                )
                .await;
                response.validate().map(|_| response)
            }
            Err(error) => Err(error),
        };

        match result {
            Ok(response) => {
                let reply = response.raw_response.clone();
                self.emit_command_event(|| {
                    CommandEvent::Succeeded(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: command_name.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    })
                });
                let output = op.handle_response(response);
                if let Err(ref error) = output {
                    self.report_error(connection, error).await;
                }
                output
            }
            Err(error) => {
                self.emit_command_event(|| {
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: command_name.clone(),
                        failure: error.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    })
                });
                self.report_error(connection, &error).await;
                Err(error)
            }
        }
    }

    /// Hands an error produced by a checked-out connection to the topology, which decides
    /// whether the server should be marked unknown and its pool cleared.
    async fn report_error(&self, connection: &PooledConnection, error: &Error) {
        if !(error.is_network_error() || error.is_server_error()) {
            return;
        }
        self.inner
            .topology
            .handle_application_error(
                connection.address().clone(),
                error.clone(),
                HandshakePhase::after_completion(connection),
            )
            .await;
    }

    async fn gossip_times(
        &self,
        cluster_time: Option<&ClusterTime>,
        operation_time: Option<Timestamp>,
        session: Option<&mut ClientSession>,
    ) {
        if let Some(cluster_time) = cluster_time {
            self.inner
                .topology
                .advance_cluster_time(cluster_time.clone())
                .await;
        }
        if let Some(session) = session {
            if let Some(cluster_time) = cluster_time {
                session.advance_cluster_time(cluster_time);
            }
            if let Some(operation_time) = operation_time {
                session.advance_operation_time(operation_time);
            }
        }
    }

    /// Whether the operation may be retried once a connection to `conn`'s server is in hand.
    fn retryability<T: Operation>(
        &self,
        op: &T,
        conn: &PooledConnection,
        has_session: bool,
    ) -> Retryability {
        match self.retryability_before_checkout(op, has_session) {
            Retryability::Write => {
                let supported = conn
                    .stream_description()
                    .map(|sd| sd.supports_retryable_writes())
                    .unwrap_or(false);
                if supported {
                    Retryability::Write
                } else {
                    Retryability::None
                }
            }
            other => other,
        }
    }

    /// The retryability allowed by the client's options, before anything is known about the
    /// server.
    fn retryability_before_checkout<T: Operation>(
        &self,
        op: &T,
        has_session: bool,
    ) -> Retryability {
        let options = &self.inner.options;
        match op.retryability() {
            Retryability::Read if options.retry_reads != Some(false) => Retryability::Read,
            Retryability::Write if options.retry_writes != Some(false) && has_session => {
                Retryability::Write
            }
            _ => Retryability::None,
        }
    }

    fn emit_command_event(&self, generate_event: impl FnOnce() -> CommandEvent) {
        self.inner.command_event_emitter.emit_event(generate_event);
    }
}

/// A retry that cannot even select a server or check out a connection reports the error that
/// caused it rather than its own.
/// The error reported when a retry cannot get as far as running its command. A retry cut short
/// by the deadline reports a timeout caused by the first attempt's error.
fn first_error_or(retry: Option<ExecutionRetry>, error: Error, deadline: Option<Instant>) -> Error {
    match retry {
        Some(retry) if deadline_passed(deadline) => {
            Error::network_timeout().with_source(retry.first_error)
        }
        Some(retry) => retry.first_error,
        None => error,
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

async fn with_deadline<F, O>(deadline: Option<Instant>, future: F) -> Result<O>
where
    F: std::future::Future<Output = Result<O>>,
{
    match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            runtime::timeout(remaining, future).await?
        }
        None => future.await,
    }
}
