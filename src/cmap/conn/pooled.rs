use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use derive_where::derive_where;

use super::{Connection, PendingConnection};
use crate::{
    cmap::requests::PoolManager,
    event::{
        cmap::{
            CmapEvent,
            CmapEventEmitter,
            ConnectionCheckedInEvent,
            ConnectionCheckedOutEvent,
            ConnectionClosedEvent,
            ConnectionClosedReason,
            ConnectionReadyEvent,
        },
        command::ConnectionInfo,
    },
    runtime::AsyncStream,
};

/// A [`Connection`] owned by a pool. While checked out it remembers how to get back home, and
/// dropping it returns it to the pool.
#[derive_where(Debug)]
pub(crate) struct PooledConnection {
    connection: Option<Connection>,

    /// The pool generation this connection was created in.
    pub(crate) generation: u32,

    /// When the connection last entered the idle set.
    idle_since: Option<Instant>,

    /// Set while the connection is checked out.
    home: Option<PoolManager>,

    #[derive_where(skip)]
    events: CmapEventEmitter,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection accessed after check-in"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection
            .as_mut()
            .unwrap_or_else(|| unreachable!("connection accessed after check-in"))
    }
}

impl PooledConnection {
    pub(crate) fn new(pending: PendingConnection, stream: AsyncStream) -> Self {
        Self {
            connection: Some(Connection::new(
                pending.address,
                stream,
                pending.id,
                pending.time_created,
            )),
            generation: pending.generation,
            idle_since: None,
            home: None,
            events: pending.event_emitter,
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn mark_as_available(&mut self) {
        self.home = None;
        self.idle_since = Some(Instant::now());
    }

    pub(crate) fn mark_as_in_use(&mut self, home: PoolManager) {
        self.home = Some(home);
        self.idle_since = None;
    }

    /// Whether the connection has sat in the idle set for at least `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (self.idle_since, max_idle_time) {
            (Some(since), Some(max)) => since.elapsed() >= max,
            _ => false,
        }
    }

    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Emits a [`ConnectionClosedEvent`] and drops the connection without returning it.
    pub(crate) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    fn close(&mut self, reason: ConnectionClosedReason) {
        self.home = None;
        self.events.emit_event(|| {
            ConnectionClosedEvent {
                address: self.address.clone(),
                connection_id: self.id,
                reason,
                error: self.error().cloned(),
            }
            .into()
        });
    }

    pub(crate) fn emit_checked_out(&self, checkout_started: Instant) {
        self.events.emit_event(|| {
            CmapEvent::ConnectionCheckedOut(ConnectionCheckedOutEvent {
                address: self.address.clone(),
                connection_id: self.id,
                duration: checkout_started.elapsed(),
            })
        });
    }

    pub(crate) fn emit_checked_in(&self) {
        self.events.emit_event(|| {
            CmapEvent::ConnectionCheckedIn(ConnectionCheckedInEvent {
                address: self.address.clone(),
                connection_id: self.id,
            })
        });
    }

    pub(crate) fn emit_ready(&self) {
        self.events.emit_event(|| {
            CmapEvent::ConnectionReady(ConnectionReadyEvent {
                address: self.address.clone(),
                connection_id: self.id,
                duration: self.time_created.elapsed(),
            })
        });
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // only checked-out connections have a home; the pool closes the rest itself.
        let Some(home) = self.home.take() else {
            return;
        };
        let returning = PooledConnection {
            connection: self.connection.take(),
            generation: self.generation,
            idle_since: None,
            home: None,
            events: self.events.clone(),
        };
        if let Err(mut orphan) = home.check_in(returning) {
            orphan.close(ConnectionClosedReason::PoolClosed);
        }
    }
}
