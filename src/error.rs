//! The [`Error`] and [`Result`] types returned throughout the crate.

use std::{
    any::Any,
    collections::HashSet,
    fmt,
    io,
    sync::Arc,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{options::ServerAddress, sdam::TopologyDescription};

/// Server error codes, grouped by what they say about the server that returned them.
mod codes {
    pub(super) const INTERRUPTED_AT_SHUTDOWN: i32 = 11600;
    pub(super) const SHUTDOWN_IN_PROGRESS: i32 = 91;
    pub(super) const CURSOR_NOT_FOUND: i32 = 43;

    /// The server is starting up or stepping down.
    pub(super) const RECOVERING: &[i32] = &[
        INTERRUPTED_AT_SHUTDOWN,
        11602,
        13436,
        189,
        SHUTDOWN_IN_PROGRESS,
    ];

    /// The server is no longer the primary. 10058 predates the others and is not retried.
    pub(super) const NOT_WRITABLE_PRIMARY: &[i32] = &[10107, 13435, 10058];

    /// Failures a second attempt on another server may not hit.
    pub(super) const TRANSIENT: &[i32] = &[
        INTERRUPTED_AT_SHUTDOWN,
        11602,
        10107,
        13435,
        13436,
        189,
        SHUTDOWN_IN_PROGRESS,
        7,
        6,
        89,
        9001,
        262,
    ];

    /// Cursor operations may also be retried after this one; writes may not.
    pub(super) const EXCEEDED_TIME_LIMIT: i32 = 134;
}

/// Label the server (or the client, for network errors) puts on errors a write may be retried
/// after.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// Shorthand for results whose error is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Any failure reported by this crate.
///
/// What went wrong is described by [`Error::kind`]; labels attached by the server or the client
/// say how the failure may be handled.
#[derive(Clone, Debug, Error)]
#[cfg_attr(
    feature = "error-backtrace",
    error("Kind: {kind}, labels: {labels:?}, backtrace: {backtrace}")
)]
#[cfg_attr(
    not(feature = "error-backtrace"),
    error("Kind: {kind}, labels: {labels:?}")
)]
#[non_exhaustive]
pub struct Error {
    /// What went wrong. Boxed so `Result<T>` stays small.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,

    /// The earlier failure this one replaced, e.g. the first attempt of a retried operation.
    #[source]
    pub(crate) source: Option<Box<Error>>,

    #[cfg(feature = "error-backtrace")]
    pub(crate) backtrace: Arc<std::backtrace::Backtrace>,
}

impl Error {
    /// Wraps a value of the caller's choosing, e.g. to fail a connection attempt from a custom
    /// [`StreamConnector`](crate::StreamConnector).
    pub fn custom(value: impl Any + Send + Sync) -> Self {
        ErrorKind::Custom(Arc::new(value)).into()
    }

    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut all_labels: HashSet<String> = kind.server_labels().iter().cloned().collect();
        all_labels.extend(labels.into_iter().flatten());
        Self {
            kind: Box::new(kind),
            labels: all_labels,
            source: None,
            #[cfg(feature = "error-backtrace")]
            backtrace: Arc::new(std::backtrace::Backtrace::capture()),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn authentication_error(message: impl Into<String>) -> Self {
        ErrorKind::Authentication {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn network_timeout() -> Self {
        io::ErrorKind::TimedOut.into()
    }

    pub(crate) fn network(message: impl Into<String>) -> Self {
        io::Error::new(io::ErrorKind::ConnectionAborted, message.into()).into()
    }

    /// The error handed to checkouts that were waiting on a pool when it was cleared.
    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        ErrorKind::ConnectionPoolCleared {
            message: format!("connection pool for {} was cleared after: {}", address, cause),
        }
        .into()
    }

    pub(crate) fn server_selection(
        message: impl Into<String>,
        topology: Option<TopologyDescription>,
    ) -> Self {
        ErrorKind::ServerSelection {
            message: message.into(),
            topology: topology.map(Box::new),
        }
        .into()
    }

    pub(crate) fn shutdown() -> Self {
        ErrorKind::Shutdown.into()
    }

    pub(crate) fn with_source(mut self, source: impl Into<Option<Error>>) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    fn io_kind(&self) -> Option<io::ErrorKind> {
        match self.kind.as_ref() {
            ErrorKind::Io(error) => Some(error.kind()),
            _ => None,
        }
    }

    /// Whether the connection the operation ran on failed. A cleared pool counts, since the
    /// operation never got a working connection.
    pub fn is_network_error(&self) -> bool {
        self.io_kind().is_some() || self.is_pool_cleared()
    }

    /// Whether a socket read or write timed out.
    pub fn is_network_timeout(&self) -> bool {
        self.io_kind() == Some(io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        self.io_kind()
            .is_some_and(|kind| kind != io::ErrorKind::TimedOut)
    }

    /// Whether no suitable server was found before the selection timeout.
    pub fn is_server_selection_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::ServerSelection { .. })
    }

    /// Whether no connection could be checked out before the wait queue timeout.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(*self.kind, ErrorKind::WaitQueueTimeout { .. })
    }

    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(*self.kind, ErrorKind::ConnectionPoolCleared { .. })
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Authentication { .. })
    }

    /// Whether the server, rather than the client or the network, reported this error.
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::Authentication { .. } | ErrorKind::Command(_) | ErrorKind::Write(_)
        )
    }

    fn code_in(&self, set: &[i32]) -> bool {
        self.sdam_code().is_some_and(|code| set.contains(&code))
    }

    fn is_transient(&self) -> bool {
        self.is_network_error() || self.code_in(codes::TRANSIENT)
    }

    pub(crate) fn is_read_retryable(&self) -> bool {
        self.is_transient() || self.sdam_code() == Some(codes::EXCEEDED_TIME_LIMIT)
    }

    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether the client should label this error [`RETRYABLE_WRITE_ERROR`] itself, for servers
    /// too old to do so.
    pub(crate) fn should_add_retryable_write_label(&self) -> bool {
        self.is_transient()
    }

    /// Labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    #[allow(missing_docs)]
    pub fn contains_label(&self, label: impl AsRef<str>) -> bool {
        self.labels.contains(label.as_ref())
    }

    pub(crate) fn add_label(&mut self, label: impl AsRef<str>) {
        self.labels.insert(label.as_ref().to_owned());
    }

    /// The server error code that decides how this error affects the topology, looking through
    /// to the source error when this one carries none.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        let own = match self.kind.as_ref() {
            ErrorKind::Command(error) => Some(error.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(error)) => Some(error.code),
            _ => None,
        };
        own.or_else(|| self.source.as_deref().and_then(Error::sdam_code))
    }

    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.code_in(codes::NOT_WRITABLE_PRIMARY)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.code_in(&[codes::INTERRUPTED_AT_SHUTDOWN, codes::SHUTDOWN_IN_PROGRESS])
    }

    /// Whether the server answered as though it were no longer primary or still recovering.
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.code_in(codes::RECOVERING) || self.is_notwritableprimary()
    }

    pub(crate) fn is_cursor_not_found(&self) -> bool {
        self.sdam_code() == Some(codes::CURSOR_NOT_FOUND)
    }

    #[cfg(test)]
    pub(crate) fn code(&self) -> Option<i32> {
        self.sdam_code()
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(error: E) -> Self {
        Error::new(error.into(), None::<Vec<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(error: bson::de::Error) -> Self {
        Self::BsonDeserialization(error)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(error: bson::ser::Error) -> Self {
        Self::BsonSerialization(error)
    }
}

impl From<bson::raw::Error> for ErrorKind {
    fn from(error: bson::raw::Error) -> Self {
        Self::InvalidResponse {
            message: error.to_string(),
        }
    }
}

impl From<bson::raw::ValueAccessError> for ErrorKind {
    fn from(error: bson::raw::ValueAccessError) -> Self {
        Self::InvalidResponse {
            message: error.to_string(),
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        Self::Io(Arc::new(kind.into()))
    }
}

/// What went wrong.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An option or argument was rejected before anything was sent.
    #[error("Invalid argument: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The handshake's authentication step failed.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// The server replied with `ok: 0`.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// A checkout was waiting on a pool that got cleared.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// See [`Error::custom`].
    #[error("Custom user error")]
    Custom(Arc<dyn Any + Send + Sync>),

    /// A bug in this crate.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// A reply that could not be parsed or lacked required fields.
    #[error("Invalid server reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// No suitable server was found in time. `topology` is the last description consulted.
    #[error("Server selection timeout: {message}")]
    #[non_exhaustive]
    ServerSelection {
        message: String,
        topology: Option<Box<TopologyDescription>>,
    },

    /// The client was shut down.
    #[error("Client has been shut down")]
    Shutdown,

    /// No connection to `address` became available before the wait queue timeout.
    #[error("Timed out waiting for a connection to {address}")]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },

    /// A write was not (fully) applied.
    #[error("Write failed: {0:?}")]
    Write(WriteFailure),
}

impl ErrorKind {
    fn server_labels(&self) -> &[String] {
        match self {
            ErrorKind::Command(error) => &error.labels,
            ErrorKind::Write(WriteFailure::WriteConcernError(error)) => &error.labels,
            _ => &[],
        }
    }
}

/// The body of a failed command reply.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CommandError {
    #[allow(missing_docs)]
    pub code: i32,

    #[allow(missing_docs)]
    #[serde(default)]
    pub code_name: String,

    #[allow(missing_docs)]
    #[serde(rename = "errmsg", default)]
    pub message: String,

    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.code_name, self.message)
    }
}

/// A write that was applied but could not be confirmed at the requested write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct WriteConcernError {
    #[allow(missing_docs)]
    pub code: i32,

    #[allow(missing_docs)]
    #[serde(default)]
    pub code_name: String,

    #[allow(missing_docs)]
    #[serde(alias = "errmsg", default)]
    pub message: String,

    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

/// The failure of one document in a write.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct IndexedWriteError {
    /// Position of the document in the request.
    pub index: usize,

    #[allow(missing_docs)]
    pub code: i32,

    #[allow(missing_docs)]
    #[serde(default)]
    pub code_name: Option<String>,

    #[allow(missing_docs)]
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// How a write failed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteFailure {
    #[allow(missing_docs)]
    WriteConcernError(WriteConcernError),

    /// One entry per document that could not be written.
    WriteErrors(Vec<IndexedWriteError>),
}
