mod find;
mod get_more;
mod insert;
mod kill_cursors;
mod run_command;


use std::{collections::VecDeque, fmt, str::FromStr};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

use crate::{
    bson::{self, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    error::{Error, ErrorKind, IndexedWriteError, Result, WriteConcernError, WriteFailure},
    selection_criteria::SelectionCriteria,
};

pub(crate) use find::Find;
pub use find::{CursorType, FindOptions};
pub(crate) use get_more::{GetMore, GetMoreResult};
pub(crate) use insert::Insert;
pub use insert::{InsertOptions, InsertResult};
pub(crate) use kill_cursors::KillCursors;
pub(crate) use run_command::RunCommand;

/// The kind of access an operation needs, which restricts the servers it may be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
    /// A read, routed according to the operation's read preference.
    Read,

    /// A write, which always requires a writable server.
    Write,
}

/// Which retry rules apply to an operation.
#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// A single server command the executor knows how to route, send and interpret.
pub(crate) trait Operation {
    type Output;

    /// The command name, used for logging and events.
    const NAME: &'static str;

    /// Produces the command body for the connection it is about to be sent on. Called once per
    /// attempt.
    fn build(&mut self, server: &StreamDescription) -> Result<Command>;

    /// Turns a successful reply into the operation's output.
    fn handle_response(&self, response: CommandResponse) -> Result<Self::Output>;

    /// Where this operation must run. `None` defers to the client's default.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    fn kind(&self) -> OperationKind {
        if self.retryability() == Retryability::Write {
            OperationKind::Write
        } else {
            OperationKind::Read
        }
    }

    /// Whether an explicit session's operation time is sent as `afterClusterTime`.
    fn supports_read_concern(&self) -> bool {
        false
    }

    /// Whether the command may carry an `lsid`.
    fn supports_sessions(&self) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}

/// A collection, written `db.coll`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// Database name.
    pub db: String,
    /// Collection name. May itself contain dots.
    pub coll: String,
}

impl Namespace {
    #[allow(missing_docs)]
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::invalid_argument(format!(
                "invalid namespace: \"{}\"",
                s
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::from_str(&s).map_err(|e| D::Error::custom(e.to_string()))
    }
}

impl Serialize for Namespace {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Merges the serialized form of `options` into a command body. `T` has to serialize as a
/// document.
pub(crate) fn append_options<T: Serialize>(body: &mut Document, options: Option<&T>) -> Result<()> {
    if let Some(options) = options {
        body.extend(bson::to_document(options)?);
    }
    Ok(())
}

/// The server reads batch sizes as signed 32-bit integers.
pub(crate) fn validate_batch_size(batch_size: Option<u32>) -> Result<()> {
    if batch_size.is_some_and(|size| i32::try_from(size).is_err()) {
        return Err(Error::invalid_argument(
            "batchSize does not fit in a signed 32-bit integer",
        ));
    }
    Ok(())
}

#[derive(Deserialize, Debug)]
pub(crate) struct EmptyBody {}

#[derive(Deserialize, Debug)]
pub(crate) struct WriteResponseBody<T = EmptyBody> {
    #[serde(flatten)]
    body: T,

    n: u64,

    #[serde(rename = "writeErrors")]
    write_errors: Option<Vec<IndexedWriteError>>,

    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

impl<T> WriteResponseBody<T> {
    /// Write errors take precedence over a write concern error.
    fn validate(&self) -> Result<()> {
        let failure = match (&self.write_errors, &self.write_concern_error) {
            (Some(errors), _) => WriteFailure::WriteErrors(errors.clone()),
            (None, Some(wc_error)) => WriteFailure::WriteConcernError(wc_error.clone()),
            (None, None) => return Ok(()),
        };
        Err(Error::new(ErrorKind::Write(failure), self.labels.clone()))
    }
}

/// The body of a reply to a command that opened a cursor.
#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: Namespace,

    pub(crate) first_batch: VecDeque<Document>,
}
