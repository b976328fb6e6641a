//! Events describing what the pools, the topology monitor and the command executor are doing.

pub mod cmap;
pub mod command;
pub mod sdam;

use std::{fmt, sync::Arc};

use derive_where::derive_where;
use futures_core::future::BoxFuture;
use tokio::sync::mpsc;

use crate::{bson::oid::ObjectId, runtime};

/// Where a family of events is delivered.
///
/// A plain closure works through [`EventHandler::callback`]; a `tokio` channel sender converts
/// directly:
///
/// ```rust
/// # use mongodb_driver_core::{event::EventHandler, options::ClientOptions};
/// # async fn example() {
/// let (tx, mut rx) = tokio::sync::mpsc::channel(64);
/// let options = ClientOptions::builder()
///     .command_event_handler(tx)
///     .sdam_event_handler(EventHandler::callback(|event| println!("{:?}", event)))
///     .build();
/// tokio::spawn(async move {
///     while let Some(event) = rx.recv().await {
///         println!("{:?}", event);
///     }
/// });
/// # let _ = options;
/// # }
/// ```
///
/// Callbacks run on the task that produced the event, so they should return quickly. Async
/// callbacks and channel sends are spawned and never hold up the driver.
#[derive_where(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    #[allow(missing_docs)]
    Callback(Arc<dyn Fn(T) + Sync + Send>),
    #[allow(missing_docs)]
    AsyncCallback(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Sync + Send>),
    /// Events are sent on the channel. If the receiver is gone they are dropped.
    TokioMpsc(mpsc::Sender<T>),
}

impl<T> fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Callback(_) => "Callback",
            Self::AsyncCallback(_) => "AsyncCallback",
            Self::TokioMpsc(_) => "TokioMpsc",
        };
        f.debug_tuple("EventHandler").field(&kind).finish()
    }
}

impl<T> From<mpsc::Sender<T>> for EventHandler<T> {
    fn from(sender: mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(sender)
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    #[allow(missing_docs)]
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    #[allow(missing_docs)]
    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: T) {
        match self {
            Self::Callback(callback) => callback(event),
            Self::AsyncCallback(callback) => runtime::execute(callback(event)),
            Self::TokioMpsc(sender) => {
                let sender = sender.clone();
                runtime::execute(async move {
                    let _ = sender.send(event).await;
                });
            }
        }
    }
}

/// An event family that is also mirrored into `tracing`.
pub(crate) trait TracedEvent: Clone {
    /// Whether a subscriber would record any of this family's events.
    fn tracing_enabled() -> bool;

    fn trace(&self, topology_id: &ObjectId);
}

/// Delivers events of one family to the user's handler and to `tracing`. Events are only built
/// when one of the two is listening.
#[derive_where(Clone, Debug)]
pub(crate) struct EventEmitter<T> {
    #[derive_where(skip(Debug))]
    handler: Option<EventHandler<T>>,
    topology_id: ObjectId,
}

impl<T: TracedEvent + Send + Sync + 'static> EventEmitter<T> {
    pub(crate) fn new(handler: Option<EventHandler<T>>, topology_id: ObjectId) -> Self {
        Self {
            handler,
            topology_id,
        }
    }

    pub(crate) fn emit_event(&self, make_event: impl FnOnce() -> T) {
        let traced = T::tracing_enabled();
        if self.handler.is_none() && !traced {
            return;
        }

        let event = make_event();
        if traced {
            event.trace(&self.topology_id);
        }
        if let Some(ref handler) = self.handler {
            handler.handle(event);
        }
    }
}
