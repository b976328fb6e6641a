use tokio::sync::oneshot;

/// A request to a background worker paired with a one-shot reply slot. The requester learns the
/// outcome once the worker acknowledges it, or sees `None` if the worker drops it unanswered.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    message: M,
    reply: AcknowledgmentSender<R>,
}

impl<M, R> AcknowledgedMessage<M, R> {
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                reply: AcknowledgmentSender(tx),
            },
            AcknowledgmentReceiver(rx),
        )
    }

    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        self.reply.acknowledge(result)
    }

    /// Splits off the reply slot so the message can be consumed before acknowledging.
    pub(crate) fn into_parts(self) -> (M, AcknowledgmentSender<R>) {
        (self.message, self.reply)
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentSender<R>(oneshot::Sender<R>);

impl<R> AcknowledgmentSender<R> {
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        // the requester may have given up waiting.
        let _ = self.0.send(result.into());
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentReceiver<R>(oneshot::Receiver<R>);

impl<R> AcknowledgmentReceiver<R> {
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.0.await.ok()
    }
}
