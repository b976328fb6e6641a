use std::{collections::VecDeque, time::Duration};

use serde::Deserialize;

use crate::{
    bson::{doc, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    cursor::CursorInformation,
    error::Result,
    operation::{validate_batch_size, Operation},
    selection_criteria::SelectionCriteria,
    Namespace,
};

/// Asks the server that owns a cursor for its next batch.
#[derive(Debug)]
pub(crate) struct GetMore {
    ns: Namespace,
    cursor_id: i64,
    selection_criteria: SelectionCriteria,
    batch_size: Option<u32>,
    max_time: Option<Duration>,
}

impl GetMore {
    pub(crate) fn new(info: &CursorInformation) -> Self {
        Self {
            ns: info.ns.clone(),
            cursor_id: info.id,
            selection_criteria: SelectionCriteria::from_address(info.address.clone()),
            batch_size: info.batch_size,
            max_time: info.max_await_time(),
        }
    }
}

impl Operation for GetMore {
    type Output = GetMoreResult;

    const NAME: &'static str = "getMore";

    fn build(&mut self, _server: &StreamDescription) -> Result<Command> {
        validate_batch_size(self.batch_size)?;

        let mut body = doc! {
            Self::NAME: self.cursor_id,
            "collection": self.ns.coll.as_str(),
        };
        // zero means "server default", which is expressed by leaving the field out.
        if let Some(size) = self.batch_size.filter(|size| *size > 0) {
            body.insert("batchSize", size as i32);
        }
        if let Some(max_time) = self.max_time {
            let millis = i32::try_from(max_time.as_millis()).unwrap_or(i32::MAX);
            body.insert("maxTimeMS", millis);
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::Output> {
        let GetMoreReply { cursor } = response.body()?;
        Ok(GetMoreResult {
            batch: cursor.next_batch,
            id: cursor.id,
        })
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }
}

/// A batch fetched by getMore, with the cursor id the server reported alongside it.
#[derive(Debug)]
pub(crate) struct GetMoreResult {
    pub(crate) batch: VecDeque<Document>,
    pub(crate) id: i64,
}

impl GetMoreResult {
    /// The server closes a cursor by reporting id 0.
    pub(crate) fn exhausted(&self) -> bool {
        self.id == 0
    }
}

#[derive(Debug, Deserialize)]
struct GetMoreReply {
    cursor: NextBatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextBatch {
    id: i64,
    next_batch: VecDeque<Document>,
}
