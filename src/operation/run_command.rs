use crate::{
    bson::Document,
    bson_util,
    cmap::{Command, CommandResponse, StreamDescription},
    error::{Error, Result},
    operation::Operation,
    selection_criteria::SelectionCriteria,
};

/// Runs a caller-supplied command document and returns the reply untouched.
#[derive(Debug, Clone)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        db: String,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            db,
            command,
            selection_criteria,
        }
    }

    /// The command's name is its first key.
    fn command_name(&self) -> Option<&str> {
        bson_util::first_key(&self.command)
    }
}

impl Operation for RunCommand {
    type Output = Document;

    // only reported when the document is empty, which `build` rejects.
    const NAME: &'static str = "<empty command>";

    fn build(&mut self, _server: &StreamDescription) -> Result<Command> {
        let Some(name) = self.command_name() else {
            return Err(Error::invalid_argument("cannot run an empty command document"));
        };
        Ok(Command::new(name, self.db.clone(), self.command.clone()))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::Output> {
        Ok(response.raw_response)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    /// Cursor cleanup commands are rejected by the server when they carry an lsid.
    fn supports_sessions(&self) -> bool {
        self.command_name().is_some_and(|name| {
            !name.eq_ignore_ascii_case("killCursors")
                && !name.eq_ignore_ascii_case("parallelCollectionScan")
        })
    }

    fn name(&self) -> &str {
        self.command_name().unwrap_or(Self::NAME)
    }
}
