use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    bson::{Document, RawDocumentBuf},
    error::Result,
    operation::{self, CursorType},
    options::ServerAddress,
    Namespace,
};

/// What an initial `find` reply hands to a new [`Cursor`](crate::Cursor).
#[derive(Debug, Clone)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInformation,
    pub(crate) initial_buffer: VecDeque<Document>,
}

impl CursorSpecification {
    pub(crate) fn new(
        info: operation::CursorInfo,
        address: ServerAddress,
        batch_size: impl Into<Option<u32>>,
        max_time: impl Into<Option<Duration>>,
        cursor_type: CursorType,
    ) -> Self {
        Self {
            info: CursorInformation {
                ns: info.ns,
                id: info.id,
                address,
                batch_size: batch_size.into(),
                max_time: max_time.into(),
                cursor_type,
            },
            initial_buffer: info.first_batch,
        }
    }
}

/// Static information about a cursor. Only `id` changes over the cursor's lifetime, when the
/// server reports it closed.
#[derive(Clone, Debug)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,
    pub(crate) address: ServerAddress,
    pub(crate) id: i64,
    pub(crate) batch_size: Option<u32>,
    pub(crate) max_time: Option<Duration>,
    pub(crate) cursor_type: CursorType,
}

impl CursorInformation {
    /// How long a getMore may block waiting for new documents. Only tailable await cursors
    /// wait.
    pub(crate) fn max_await_time(&self) -> Option<Duration> {
        match self.cursor_type {
            CursorType::TailableAwait => self.max_time,
            _ => None,
        }
    }

    pub(crate) fn is_tailable(&self) -> bool {
        self.cursor_type.is_tailable()
    }
}

/// Where a cursor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CursorStatus {
    /// The cursor holds its first batch but has not been positioned on a document yet.
    Unstarted,

    /// The cursor is positioned on a document.
    Active,

    /// Every document the server has produced so far has been consumed. Terminal unless the
    /// cursor is tailable and still open on the server, in which case
    /// [`Cursor::begin`](crate::Cursor::begin) polls for new documents.
    Exhausted,
}

/// The buffered batch of a cursor together with its lifecycle status.
#[derive(Debug)]
pub(super) enum CursorState {
    Unstarted(VecDeque<RawDocumentBuf>),

    /// The front of the buffer is the current document.
    Active(VecDeque<RawDocumentBuf>),

    Exhausted,
}

impl CursorState {
    pub(super) fn new(initial_buffer: VecDeque<Document>) -> Result<Self> {
        let buffer = initial_buffer
            .iter()
            .map(RawDocumentBuf::from_document)
            .collect::<std::result::Result<VecDeque<_>, _>>()?;
        Ok(Self::Unstarted(buffer))
    }

    pub(super) fn status(&self) -> CursorStatus {
        match self {
            Self::Unstarted(_) => CursorStatus::Unstarted,
            Self::Active(_) => CursorStatus::Active,
            Self::Exhausted => CursorStatus::Exhausted,
        }
    }

    /// Positions the cursor on the first buffered document, if there is one. An empty buffer
    /// leaves the state unchanged so the caller can decide whether to fetch more.
    pub(super) fn start(self) -> Self {
        match self {
            Self::Unstarted(buffer) if !buffer.is_empty() => Self::Active(buffer),
            other => other,
        }
    }

    /// Replaces the buffer with a freshly fetched batch. An empty batch exhausts the cursor.
    pub(super) fn with_batch(self, batch: VecDeque<RawDocumentBuf>) -> Self {
        if batch.is_empty() {
            Self::Exhausted
        } else {
            Self::Active(batch)
        }
    }

    pub(super) fn current(&self) -> Option<&RawDocumentBuf> {
        match self {
            Self::Active(buffer) => buffer.front(),
            _ => None,
        }
    }

    /// Consumes the current document. Returns whether another buffered document is now current.
    pub(super) fn consume(&mut self) -> bool {
        match self {
            Self::Active(buffer) => {
                buffer.pop_front();
                !buffer.is_empty()
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(super) fn buffer_is_empty(&self) -> bool {
        match self {
            Self::Unstarted(buffer) | Self::Active(buffer) => buffer.is_empty(),
            Self::Exhausted => true,
        }
    }
}

/// The single logical position of a cursor, shared with every handle obtained from it.
#[derive(Debug)]
pub(super) struct PositionCell {
    /// Distinguishes cursors; handles from different cursors never compare equal.
    cursor_seq: u64,

    /// How many documents have been consumed.
    consumed: AtomicU64,

    exhausted: AtomicBool,
}

static NEXT_CURSOR_SEQ: AtomicU64 = AtomicU64::new(0);

impl PositionCell {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            cursor_seq: NEXT_CURSOR_SEQ.fetch_add(1, Ordering::Relaxed),
            consumed: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
        })
    }

    pub(super) fn cursor_seq(&self) -> u64 {
        self.cursor_seq
    }

    pub(super) fn position(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    pub(super) fn increment(&self) {
        self.consumed.fetch_add(1, Ordering::SeqCst);
    }

    pub(super) fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub(super) fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::SeqCst);
    }
}
