pub mod auth;
mod executor;
pub mod options;
pub mod session;
#[cfg(test)]
mod test;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use derive_where::derive_where;

use crate::{
    bson::Document,
    cursor::{Cursor, CursorSpecification},
    error::{Error, Result},
    event::command::CommandEventEmitter,
    operation::{
        CursorBody,
        CursorType,
        Find,
        FindOptions,
        Insert,
        InsertOptions,
        InsertResult,
        RunCommand,
    },
    options::{ClientOptions, ServerAddress},
    sdam::{Topology, TopologyDescription},
    selection_criteria::SelectionCriteria,
    ClientSession,
    Namespace,
};

/// A handle to a deployment. It owns the background monitors and the connection pools, and
/// routes every operation.
///
/// Clones are cheap and share the same monitors and pools, so one `Client` can be handed to as
/// many tasks as needed:
///
/// ```no_run
/// # use mongodb_driver_core::{bson::doc, Client, error::Result};
/// #
/// # async fn start_workers() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://db.example.com").await?;
///
/// for i in 0..5 {
///     let client_ref = client.clone();
///
///     tokio::task::spawn(async move {
///         let reply = client_ref
///             .run_command(format!("db{}", i), doc! { "ping": 1 }, None)
///             .await;
///
///         // Do something with the reply
///     });
/// }
/// #
/// # Ok(())
/// # }
/// ```
///
/// ## Shutdown
///
/// The background monitoring tasks stop once every copy of a `Client` has been dropped.
/// [`Client::shutdown`] stops them immediately instead; any operation started afterwards fails
/// with [`ErrorKind::Shutdown`](crate::error::ErrorKind::Shutdown).
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive_where(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    #[derive_where(skip)]
    command_event_emitter: CommandEventEmitter,
}

impl Client {
    /// Parses `uri` with [`ClientOptions::parse`](crate::options::ClientOptions::parse) and
    /// creates a client from the result.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri)?;
        Client::with_options(options)
    }

    /// Creates a client for the deployment `options` describes, after validating them.
    ///
    /// Monitoring starts immediately in the background, so this must be called from within a
    /// tokio runtime.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::invalid_argument(
                "a Client must be created from within a tokio runtime",
            ));
        }

        let topology = Topology::new(options.clone());
        let command_event_emitter =
            CommandEventEmitter::new(options.command_event_handler.clone(), topology.id);

        Ok(Self {
            inner: Arc::new(ClientInner {
                topology,
                options,
                command_event_emitter,
            }),
        })
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The default selection criteria of this client, used by operations that do not specify
    /// their own.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.options.selection_criteria.as_ref()
    }

    /// Runs a database-level command against the database `db`.
    ///
    /// The reply is returned as-is; a reply with `ok: 0` is turned into an
    /// [`ErrorKind::Command`](crate::error::ErrorKind::Command) error. Commands are never
    /// retried, since it is unknown whether they are idempotent.
    pub async fn run_command(
        &self,
        db: impl Into<String>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let op = RunCommand::new(db.into(), command, selection_criteria.into());
        self.execute_operation(op, None).await
    }

    /// Runs a database-level command against the database `db` using the provided session.
    pub async fn run_command_with_session(
        &self,
        db: impl Into<String>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let op = RunCommand::new(db.into(), command, selection_criteria.into());
        self.execute_operation(op, session).await
    }

    /// Runs a database-level command, giving up once `timeout` has elapsed.
    ///
    /// The timeout covers server selection, connection checkout and the round trip. If it
    /// expires while the command is in flight, the connection is discarded and a network
    /// timeout error is returned.
    pub async fn run_command_with_timeout(
        &self,
        db: impl Into<String>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        timeout: Duration,
    ) -> Result<Document> {
        let op = RunCommand::new(db.into(), command, selection_criteria.into());
        let deadline = Instant::now() + timeout;
        self.execute_operation_with_deadline(op, None, Some(deadline))
            .await
    }

    /// Opens a [`Cursor`] over the result set of a command run through
    /// [`run_command`](Client::run_command), such as `find` or `aggregate`.
    ///
    /// `reply` must carry the `cursor` document the server sent back, and `address` must be the
    /// server that produced it: every `getMore` for the cursor goes there. The cursor runs its
    /// `getMore`s outside of any session.
    pub fn open_cursor(&self, address: ServerAddress, reply: Document) -> Result<Cursor> {
        let spec = cursor_specification(address, reply)?;
        Cursor::new(self.clone(), spec, None)
    }

    /// Opens a [`Cursor`] over the result set of a command run through
    /// [`run_command_with_session`](Client::run_command_with_session). The cursor's
    /// `getMore`s carry the session's id.
    pub fn open_cursor_with_session(
        &self,
        address: ServerAddress,
        reply: Document,
        session: &ClientSession,
    ) -> Result<Cursor> {
        let spec = cursor_specification(address, reply)?;
        Cursor::new(self.clone(), spec, Some(session.detached()))
    }

    /// Finds the documents in the namespace `ns` matching `filter`.
    ///
    /// The returned [`Cursor`] holds the first batch and fetches the rest on demand. The cursor
    /// runs its `getMore`s in the same implicit session as the initial `find`.
    pub async fn find(
        &self,
        ns: Namespace,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor> {
        let mut session = ClientSession::new(true);
        let find = Find::new(ns, filter, options.into());
        let spec = self.execute_operation(find, &mut session).await?;
        Cursor::new(self.clone(), spec, Some(session))
    }

    /// Finds the documents in the namespace `ns` matching `filter` using the provided session.
    ///
    /// The cursor's `getMore`s carry the session's id. Cluster times they observe are not
    /// reported back to `session`.
    pub async fn find_with_session(
        &self,
        ns: Namespace,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
        session: &mut ClientSession,
    ) -> Result<Cursor> {
        let find = Find::new(ns, filter, options.into());
        let spec = self.execute_operation(find, &mut *session).await?;
        Cursor::new(self.clone(), spec, Some(session.detached()))
    }

    /// Inserts `documents` into the namespace `ns`.
    ///
    /// Documents without an `_id` are given a generated `ObjectId`. The insert is retried once
    /// if it fails with a retryable error and the deployment supports retryable writes.
    pub async fn insert(
        &self,
        ns: Namespace,
        documents: impl IntoIterator<Item = Document>,
        options: impl Into<Option<InsertOptions>>,
    ) -> Result<InsertResult> {
        let insert = Insert::new(ns, documents.into_iter().collect(), options.into());
        self.execute_operation(insert, None).await
    }

    /// Inserts `documents` into the namespace `ns` using the provided session.
    pub async fn insert_with_session(
        &self,
        ns: Namespace,
        documents: impl IntoIterator<Item = Document>,
        options: impl Into<Option<InsertOptions>>,
        session: &mut ClientSession,
    ) -> Result<InsertResult> {
        let insert = Insert::new(ns, documents.into_iter().collect(), options.into());
        self.execute_operation(insert, session).await
    }

    /// Starts a new explicit [`ClientSession`].
    ///
    /// Reads run through an explicit session observe the writes previously run through it.
    pub fn start_session(&self) -> ClientSession {
        ClientSession::new(false)
    }

    /// A snapshot of the client's current view of the deployment.
    pub fn topology_description(&self) -> TopologyDescription {
        self.inner.topology.description()
    }

    /// Stops monitoring and closes every connection pool.
    ///
    /// Operations in progress are allowed to finish; connections they hold are closed when
    /// returned. Any operation started after this returns fails with
    /// [`ErrorKind::Shutdown`](crate::error::ErrorKind::Shutdown).
    pub async fn shutdown(self) {
        self.inner.topology.shutdown().await;
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        !self.inner.topology.is_alive()
    }

    #[cfg(test)]
    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }
}

/// Reads the `cursor` document of a reply. The cursor keeps no batch size and is not tailable.
fn cursor_specification(address: ServerAddress, reply: Document) -> Result<CursorSpecification> {
    let CursorBody { cursor } = crate::bson::from_document(reply)
        .map_err(|e| Error::invalid_response(format!("reply has no usable cursor: {}", e)))?;
    Ok(CursorSpecification::new(
        cursor,
        address,
        None::<u32>,
        None::<Duration>,
        CursorType::NonTailable,
    ))
}
