//! Messages passed between pool handles and the pool's worker task.

use tokio::sync::{mpsc, oneshot};

use super::conn::pooled::PooledConnection;
use crate::{
    error::{Error, Result},
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver, AsyncJoinHandle, WorkerHandle},
};

/// How the worker serves a checkout.
#[derive(Debug)]
pub(super) enum Checkout {
    /// An established connection taken from the idle set.
    Idle(Box<PooledConnection>),

    /// A connection opened on behalf of this checkout that is still handshaking.
    Opening(AsyncJoinHandle<Result<PooledConnection>>),

    /// The pool is paused, so nothing can be handed out.
    Rejected(Error),
}

/// A checkout waiting in the pool's queue.
#[derive(Debug)]
pub(super) struct CheckoutRequest(oneshot::Sender<Checkout>);

impl CheckoutRequest {
    /// Delivers `checkout` to the waiting task. If that task already gave up, an idle connection
    /// is given back so it can be returned to the pool.
    pub(super) fn answer(self, checkout: Checkout) -> Option<PooledConnection> {
        match self.0.send(checkout) {
            Err(Checkout::Idle(connection)) => Some(*connection),
            _ => None,
        }
    }

    /// Whether the waiting task stopped listening, e.g. after its wait queue timeout.
    pub(super) fn is_abandoned(&self) -> bool {
        self.0.is_closed()
    }
}

/// Submits checkouts to the worker. The worker keeps running while any clone exists.
#[derive(Clone, Debug)]
pub(super) struct CheckoutRequester {
    sender: mpsc::UnboundedSender<CheckoutRequest>,
    _handle: WorkerHandle,
}

impl CheckoutRequester {
    pub(super) fn new(handle: WorkerHandle) -> (Self, mpsc::UnboundedReceiver<CheckoutRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                _handle: handle,
            },
            receiver,
        )
    }

    /// Joins the wait queue and resolves once the worker decides how to serve this checkout.
    pub(super) async fn request(&self) -> Checkout {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(CheckoutRequest(tx)).is_err() {
            return Checkout::Rejected(Error::internal("connection pool worker has stopped"));
        }
        rx.await.unwrap_or_else(|_| {
            Checkout::Rejected(Error::internal("connection pool worker dropped a checkout"))
        })
    }
}

/// Requests that change pool state rather than hand out connections.
#[derive(Debug)]
pub(super) enum PoolCommand {
    CheckIn(Box<PooledConnection>),
    Clear(AcknowledgedMessage<Error>),
    MarkReady(AcknowledgedMessage<()>),
    Opened(Opened),
    OpenFailed,
}

/// A finished establishment reported back to the worker.
#[derive(Debug)]
pub(super) enum Opened {
    /// The connection went straight to the checkout that asked for it.
    HandedOut,

    /// The connection was opened in the background and should join the idle set.
    ForPool(Box<PooledConnection>),
}

/// Sends [`PoolCommand`]s to the worker. Unlike [`CheckoutRequester`], holding one does not keep
/// the worker alive, so checked-out connections can carry it without leaking the pool.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolManager {
    pub(super) fn new() -> (Self, mpsc::UnboundedReceiver<PoolCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    async fn round_trip(&self, command: PoolCommand, ack: AcknowledgmentReceiver<()>) {
        if self.sender.send(command).is_ok() {
            ack.wait_for_acknowledgment().await;
        }
    }

    pub(super) async fn clear(&self, cause: Error) {
        let (message, ack) = AcknowledgedMessage::package(cause);
        self.round_trip(PoolCommand::Clear(message), ack).await
    }

    pub(super) async fn mark_as_ready(&self) {
        let (message, ack) = AcknowledgedMessage::package(());
        self.round_trip(PoolCommand::MarkReady(message), ack).await
    }

    /// Returns a connection to the pool, handing it back if the worker is gone.
    pub(super) fn check_in(
        &self,
        connection: PooledConnection,
    ) -> std::result::Result<(), PooledConnection> {
        self.sender
            .send(PoolCommand::CheckIn(Box::new(connection)))
            .map_err(|rejected| match rejected.0 {
                PoolCommand::CheckIn(connection) => *connection,
                _ => unreachable!("a check-in is returned as it was sent"),
            })
    }

    pub(super) fn opened(&self, opened: Opened) {
        let _ = self.sender.send(PoolCommand::Opened(opened));
    }

    pub(super) fn open_failed(&self) {
        let _ = self.sender.send(PoolCommand::OpenFailed);
    }
}
