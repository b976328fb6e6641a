mod common;

use std::{collections::VecDeque, sync::Arc};

use serde::de::DeserializeOwned;

use self::common::{CursorState, PositionCell};
pub(crate) use self::common::{CursorInformation, CursorSpecification};
pub use self::common::CursorStatus;
use crate::{
    bson::{RawDocument, RawDocumentBuf},
    client::session::ClientSession,
    error::{Error, Result},
    operation::{GetMore, GetMoreResult, KillCursors},
    options::ServerAddress,
    trace::cursor as trace,
    Client,
    Namespace,
};

/// The results of a query, buffered one batch at a time.
///
/// A cursor starts out holding the first batch the query returned. Once that batch is consumed
/// and the server still holds the cursor open, the next batch is fetched with a `getMore` on the
/// server that ran the query. A larger batch size means fewer round trips and more documents in
/// memory at once.
///
/// ```no_run
/// # use mongodb_driver_core::{bson::{doc, Document}, error::Result, Client, Namespace};
/// # async fn do_stuff(client: Client) -> Result<()> {
/// let mut cursor = client.find(Namespace::new("db", "coll"), doc! {}, None).await?;
/// while cursor.advance().await? {
///     let doc: Document = cursor.deserialize_current()?;
///     println!("{}", doc);
/// }
/// # Ok(())
/// # }
/// ```
///
/// ## Position handles
///
/// [`Cursor::begin`] returns a [`CursorHandle`] onto the cursor's single position. Every live
/// handle observes that same position: after the cursor advances, a handle obtained earlier still
/// compares equal to a new one from `begin`.
///
/// ## Tailable cursors
///
/// A tailable cursor that has consumed everything the server produced reports
/// [`CursorStatus::Exhausted`], but stays open on the server. It is not polled again until
/// `begin` is called; if new documents have been appended by then, the cursor becomes active
/// again and yields them in insertion order.
///
/// If a `Cursor` is dropped while the server still holds it open, a `killCursors` command is
/// sent in the background. Failures of that command are logged and otherwise ignored.
#[derive(Debug)]
pub struct Cursor {
    client: Client,
    info: CursorInformation,
    state: CursorState,
    position: Arc<PositionCell>,
    session: Option<ClientSession>,
}

impl Cursor {
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        session: Option<ClientSession>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            state: CursorState::new(spec.initial_buffer)?,
            info: spec.info,
            position: PositionCell::new(),
            session,
        })
    }

    /// Positions the cursor and returns a handle onto its position.
    ///
    /// The first call positions the cursor on its first document, fetching a batch if the
    /// initial one was empty. On an active cursor this does not move the position. On an
    /// exhausted tailable cursor that the server still holds open, this polls the server once
    /// for newly appended documents and reactivates the cursor if there are any.
    pub async fn begin(&mut self) -> Result<CursorHandle> {
        match self.state.status() {
            CursorStatus::Unstarted => self.start().await?,
            CursorStatus::Active => {}
            CursorStatus::Exhausted => {
                if self.info.is_tailable() && self.info.id != 0 {
                    self.fetch().await?;
                    if self.state.status() == CursorStatus::Active {
                        trace::revived(&self.info.ns, self.info.id);
                    }
                }
            }
        }
        self.sync_position();

        Ok(CursorHandle {
            cell: self.position.clone(),
        })
    }

    /// Moves the cursor to the next document, fetching the next batch from the server when the
    /// buffered one runs out. Returns whether the cursor is now positioned on a document.
    ///
    /// The first call positions the cursor on its first document. Once the cursor is exhausted
    /// this returns `false` without contacting the server, even for tailable cursors; use
    /// [`Cursor::begin`] to poll those again.
    pub async fn advance(&mut self) -> Result<bool> {
        match self.state.status() {
            CursorStatus::Unstarted => self.start().await?,
            CursorStatus::Active => {
                self.position.increment();
                if !self.state.consume() {
                    self.fetch().await?;
                }
            }
            CursorStatus::Exhausted => return Ok(false),
        }
        self.sync_position();

        Ok(self.state.status() == CursorStatus::Active)
    }

    /// Returns a reference to the document the cursor is positioned on, if any.
    pub fn current(&self) -> Option<&RawDocument> {
        self.state.current().map(|doc| &**doc)
    }

    /// Deserializes the current document into a `T`.
    ///
    /// Returns an error if the cursor is not positioned on a document.
    pub fn deserialize_current<T: DeserializeOwned>(&self) -> Result<T> {
        let doc = self
            .state
            .current()
            .ok_or_else(|| Error::invalid_argument("cursor is not positioned on a document"))?;
        Ok(crate::bson::from_slice(doc.as_bytes())?)
    }

    /// Whether every document produced so far has been consumed.
    pub fn at_end(&self) -> bool {
        self.state.status() == CursorStatus::Exhausted
    }

    /// Where the cursor is in its lifecycle.
    pub fn status(&self) -> CursorStatus {
        self.state.status()
    }

    /// The server-side id of this cursor. Zero means the server holds no resources for it.
    pub fn id(&self) -> i64 {
        self.info.id
    }

    /// The namespace the cursor iterates over.
    pub fn namespace(&self) -> &Namespace {
        &self.info.ns
    }

    /// The address of the server that owns this cursor.
    pub fn address(&self) -> &ServerAddress {
        &self.info.address
    }

    /// Whether this cursor was opened as a tailable cursor.
    pub fn is_tailable(&self) -> bool {
        self.info.is_tailable()
    }

    async fn start(&mut self) -> Result<()> {
        take_mut::take(&mut self.state, CursorState::start);
        if self.state.status() == CursorStatus::Unstarted {
            // the initial batch was empty.
            if self.info.id == 0 {
                self.state = CursorState::Exhausted;
            } else {
                self.fetch().await?;
            }
        }
        Ok(())
    }

    /// Refills the buffer with one getMore. An empty batch, or a cursor already closed on the
    /// server, exhausts the cursor.
    async fn fetch(&mut self) -> Result<()> {
        if self.info.id == 0 {
            self.state = CursorState::Exhausted;
            return Ok(());
        }

        let get_more = GetMore::new(&self.info);
        let result = self
            .client
            .execute_operation(get_more, self.session.as_mut())
            .await;

        match result {
            Ok(result) => self.handle_get_more_result(result),
            Err(error) => {
                // the server closed the cursor, or the connection it was read over is gone; either
                // way nothing is left to kill.
                if error.is_cursor_not_found() || error.is_network_error() {
                    self.info.id = 0;
                }
                self.state = CursorState::Exhausted;
                self.sync_position();
                Err(error)
            }
        }
    }

    fn handle_get_more_result(&mut self, result: GetMoreResult) -> Result<()> {
        trace::batch_fetched(
            &self.info.ns,
            self.info.id,
            result.batch.len(),
            result.exhausted(),
        );

        let batch = result
            .batch
            .iter()
            .map(RawDocumentBuf::from_document)
            .collect::<std::result::Result<VecDeque<_>, _>>()?;
        self.info.id = result.id;
        take_mut::take(&mut self.state, |state| state.with_batch(batch));
        Ok(())
    }

    fn sync_position(&self) {
        self.position.set_exhausted(self.at_end());
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> bool {
        !self.state.buffer_is_empty()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.info.id == 0 || self.client.is_shut_down() {
            return;
        }

        let client = self.client.clone();
        let ns = self.info.ns.clone();
        let id = self.info.id;
        let address = self.info.address.clone();

        // killing is best effort, so a cursor dropped outside of a runtime is simply left for
        // the server to time out.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(kill_cursor(client, ns, id, address));
        }
    }
}

async fn kill_cursor(client: Client, ns: Namespace, cursor_id: i64, address: ServerAddress) {
    let op = KillCursors::new(ns.clone(), vec![cursor_id], address.clone());
    match client.execute_operation(op, None).await {
        Ok(_) => trace::killed(&ns, cursor_id, &address),
        Err(error) => trace::kill_failed(&ns, cursor_id, &error),
    }
}

/// A lightweight handle onto a [`Cursor`]'s single position.
///
/// Handles do not own iteration state: all handles obtained from the same cursor observe the
/// same position, so two of them always compare equal, and a handle taken before the cursor
/// advanced compares equal to one taken after. Handles from different cursors never compare
/// equal.
#[derive(Debug, Clone)]
pub struct CursorHandle {
    cell: Arc<PositionCell>,
}

impl CursorHandle {
    /// The number of documents the cursor has consumed.
    pub fn position(&self) -> u64 {
        self.cell.position()
    }

    /// Whether the cursor this handle belongs to is exhausted.
    pub fn at_end(&self) -> bool {
        self.cell.is_exhausted()
    }

    /// Advances the shared position of `cursor`, which must be the cursor this handle was
    /// obtained from. Every handle onto that cursor observes the move.
    pub async fn advance(&self, cursor: &mut Cursor) -> Result<bool> {
        if !Arc::ptr_eq(&self.cell, &cursor.position) {
            return Err(Error::invalid_argument(
                "handle does not belong to this cursor",
            ));
        }
        cursor.advance().await
    }
}

impl PartialEq for CursorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.cell.cursor_seq() == other.cell.cursor_seq() && self.position() == other.position()
    }
}

impl Eq for CursorHandle {}
