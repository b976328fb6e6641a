use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::Result,
    operation::{append_options, validate_batch_size, CursorBody, Operation, Retryability},
    selection_criteria::SelectionCriteria,
    serde_util,
    Namespace,
};

/// Whether a cursor stays open once it has returned the last matching document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum CursorType {
    /// The server closes the cursor after the last result.
    #[default]
    NonTailable,

    /// The cursor stays open at the end of a capped collection and picks up documents appended
    /// later.
    Tailable,

    /// A tailable cursor whose getMores wait up to `max_await_time` for new documents instead
    /// of returning an empty batch right away.
    TailableAwait,
}

impl CursorType {
    pub(crate) fn is_tailable(self) -> bool {
        self != CursorType::NonTailable
    }

    fn flags(self) -> &'static [&'static str] {
        match self {
            CursorType::NonTailable => &[],
            CursorType::Tailable => &["tailable"],
            CursorType::TailableAwait => &["tailable", "awaitData"],
        }
    }
}

/// Options for [`Client::find`](crate::Client::find).
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FindOptions {
    /// How many documents each batch from the server holds. This only affects memory use and
    /// the number of round trips, never which documents are returned.
    #[serde(serialize_with = "serde_util::serialize_u32_option_as_i32")]
    pub batch_size: Option<u32>,

    /// Defaults to [`CursorType::NonTailable`].
    #[serde(skip)]
    pub cursor_type: Option<CursorType>,

    /// Caps the number of documents returned. A negative value also asks for everything in one
    /// batch, after which the cursor is closed.
    #[serde(serialize_with = "serialize_absolute_value")]
    pub limit: Option<i64>,

    /// How long an awaiting getMore blocks for new documents. Only used by
    /// [`CursorType::TailableAwait`] cursors.
    #[serde(skip)]
    pub max_await_time: Option<Duration>,

    /// Server-side time limit for the initial query.
    #[serde(
        rename = "maxTimeMS",
        serialize_with = "serde_util::serialize_duration_option_as_int_millis",
        skip_deserializing
    )]
    pub max_time: Option<Duration>,

    /// Which fields of each document to return.
    pub projection: Option<Document>,

    /// Number of matching documents to pass over before returning any.
    pub skip: Option<u64>,

    /// Result order.
    pub sort: Option<Document>,

    /// Overrides the client's default criteria for choosing the server to query.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,
}

fn serialize_absolute_value<S: Serializer>(
    limit: &Option<i64>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match limit {
        Some(limit) => serializer.serialize_i64(limit.abs()),
        None => serializer.serialize_none(),
    }
}

/// Opens a cursor over the documents matching a filter.
#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: FindOptions,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options: options.unwrap_or_default(),
        }
    }
}

impl Operation for Find {
    type Output = CursorSpecification;
    const NAME: &'static str = "find";

    fn build(&mut self, _server: &StreamDescription) -> Result<Command> {
        validate_batch_size(self.options.batch_size)?;

        let mut body = doc! { Self::NAME: self.ns.coll.as_str() };
        if self.options.limit.is_some_and(|limit| limit < 0) {
            body.insert("singleBatch", true);
        }
        for flag in self.options.cursor_type.unwrap_or_default().flags() {
            body.insert(*flag, true);
        }
        append_options(&mut body, Some(&self.options))?;
        body.insert("filter", self.filter.clone());

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<CursorSpecification> {
        let CursorBody { cursor } = response.body()?;
        Ok(CursorSpecification::new(
            cursor,
            response.source_address().clone(),
            self.options.batch_size,
            self.options.max_await_time,
            self.options.cursor_type.unwrap_or_default(),
        ))
    }

    fn supports_read_concern(&self) -> bool {
        true
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options.selection_criteria.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
