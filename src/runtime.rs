mod acknowledged_message;
mod join_handle;
mod stream;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver},
    join_handle::AsyncJoinHandle,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
pub use self::stream::{AsyncStream, StreamConnector, TcpConnector};
use crate::error::{Error, Result};

/// Runs `fut` on the current tokio runtime. Panics outside of one.
#[track_caller]
pub(crate) fn spawn<F>(fut: F) -> AsyncJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Like [`spawn`], for tasks nobody waits on.
#[track_caller]
pub(crate) fn execute<F>(fut: F)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    drop(spawn(fut));
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Bounds `future` by `timeout`, failing with a network timeout error once it elapses.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    match tokio::time::timeout(timeout, future).await {
        Ok(output) => Ok(output),
        Err(_) => Err(Error::network_timeout()),
    }
}

/// A ticker for periodic background work. Missed ticks are skipped rather than bunched up.
pub(crate) fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}
