use tokio::sync::mpsc;

/// Keeps a background worker running. The worker winds down once every clone is gone.
#[derive(Clone, Debug)]
pub(crate) struct WorkerHandle(#[allow(dead_code)] mpsc::Sender<()>);

impl WorkerHandle {
    #[cfg(test)]
    pub(crate) fn new_mocked() -> Self {
        WorkerHandleListener::channel().0
    }
}

/// The worker's end of a [`WorkerHandle`].
#[derive(Debug)]
pub(crate) struct WorkerHandleListener(mpsc::Receiver<()>);

impl WorkerHandleListener {
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (tx, rx) = mpsc::channel(1);
        (WorkerHandle(tx), WorkerHandleListener(rx))
    }

    /// Pends until the last handle is dropped. Nothing is ever sent, so `recv` only completes
    /// when the channel closes.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        let _ = self.0.recv().await;
    }
}
