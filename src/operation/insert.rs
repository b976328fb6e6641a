use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, oid::ObjectId, Bson, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{append_options, Operation, Retryability, WriteResponseBody},
    Namespace,
};

/// Options for [`Client::insert`](crate::Client::insert).
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertOptions {
    /// Skips the collection's schema validation for these documents.
    pub bypass_document_validation: Option<bool>,

    /// Stop at the first failed document (the default) or attempt every document regardless.
    pub ordered: Option<bool>,
}

/// What [`Client::insert`](crate::Client::insert) reports back.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct InsertResult {
    /// The `_id` of each inserted document, keyed by the document's position in the input.
    pub inserted_ids: HashMap<usize, Bson>,
}

/// Inserts documents into one collection, assigning an `_id` to any document without one.
#[derive(Debug)]
pub(crate) struct Insert {
    ns: Namespace,
    documents: Vec<Document>,
    /// Filled in by `build`, in input order.
    ids: Vec<Bson>,
    options: InsertOptions,
}

impl Insert {
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<Document>,
        options: Option<InsertOptions>,
    ) -> Self {
        let options = options.unwrap_or_default();
        Self {
            ns,
            documents,
            ids: Vec::new(),
            options: InsertOptions {
                ordered: Some(options.ordered.unwrap_or(true)),
                ..options
            },
        }
    }
}

/// The document's `_id`, after putting a fresh ObjectId first in the document if it had none.
fn ensure_id(document: &mut Document) -> Bson {
    if let Some(id) = document.get("_id") {
        return id.clone();
    }
    let id = Bson::ObjectId(ObjectId::new());
    let rest = std::mem::replace(document, doc! { "_id": id.clone() });
    document.extend(rest);
    id
}

impl Operation for Insert {
    type Output = InsertResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, _server: &StreamDescription) -> Result<Command> {
        if self.documents.is_empty() {
            return Err(Error::invalid_argument("insert requires at least one document"));
        }
        // ids are assigned once, so a retry sends the same documents.
        if self.ids.is_empty() {
            self.ids = self.documents.iter_mut().map(ensure_id).collect();
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.as_str(),
            "documents": self.documents.clone(),
        };
        append_options(&mut body, Some(&self.options))?;
        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::Output> {
        let reply: WriteResponseBody = response.body()?;
        reply.validate()?;

        // an ordered insert stops at the first failure, so only the first n were written.
        let inserted_ids = self
            .ids
            .iter()
            .take(reply.n as usize)
            .cloned()
            .enumerate()
            .collect();
        Ok(InsertResult { inserted_ids })
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
