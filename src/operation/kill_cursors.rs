use serde::Deserialize;

use crate::{
    bson::doc,
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
    operation::Operation,
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
    Namespace,
};

/// Releases server-side cursors. Routed to the server that owns them.
#[derive(Debug)]
pub(crate) struct KillCursors {
    ns: Namespace,
    cursor_ids: Vec<i64>,
    selection_criteria: SelectionCriteria,
}

impl KillCursors {
    pub(crate) fn new(ns: Namespace, cursor_ids: Vec<i64>, address: ServerAddress) -> Self {
        Self {
            ns,
            cursor_ids,
            selection_criteria: SelectionCriteria::from_address(address),
        }
    }
}

/// The ids the server reports back, by what it did with them.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KillCursorsResult {
    #[serde(default)]
    pub(crate) cursors_killed: Vec<i64>,

    #[serde(default)]
    pub(crate) cursors_not_found: Vec<i64>,
}

impl Operation for KillCursors {
    type Output = KillCursorsResult;

    const NAME: &'static str = "killCursors";

    fn build(&mut self, _server: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "cursors": self.cursor_ids.clone(),
        };

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::Output> {
        response.body()
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }

    // killCursors never carries an lsid.
    fn supports_sessions(&self) -> bool {
        false
    }
}
