use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::Notify;

use crate::event::EventHandler;

/// Installs a subscriber printing the crate's tracing output, filtered by `RUST_LOG`. Safe to
/// call from every test.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Collects the events a handler receives so tests can inspect them or wait for more.
#[derive(Clone, Debug)]
pub(crate) struct EventBuffer<T> {
    inner: Arc<EventBufferInner<T>>,
}

#[derive(Debug)]
struct EventBufferInner<T> {
    events: Mutex<Vec<T>>,
    event_received: Notify,
}

impl<T: Clone + Send + Sync + 'static> EventBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(EventBufferInner {
                events: Mutex::new(Vec::new()),
                event_received: Notify::new(),
            }),
        }
    }

    /// A handler that records every event it is given into this buffer.
    pub(crate) fn handler(&self) -> EventHandler<T> {
        let this = self.clone();
        EventHandler::callback(move |event| this.push(event))
    }

    fn push(&self, event: T) {
        self.inner.events.lock().unwrap().push(event);
        self.inner.event_received.notify_waiters();
    }

    pub(crate) fn all(&self) -> Vec<T> {
        self.inner.events.lock().unwrap().clone()
    }

    pub(crate) fn filter_map<R>(&self, f: impl Fn(&T) -> Option<R>) -> Vec<R> {
        self.inner
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(f)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.inner.events.lock().unwrap().clear();
    }

    /// Waits until an event matching `predicate` has been recorded, returning it, or `None` once
    /// `timeout` elapses.
    pub(crate) async fn wait_for(
        &self,
        predicate: impl Fn(&T) -> bool,
        timeout: Duration,
    ) -> Option<T> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.event_received.notified();
                if let Some(event) = self
                    .inner
                    .events
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|event| predicate(event))
                {
                    return event.clone();
                }
                notified.await;
            }
        })
        .await
        .ok()
    }
}

/// Polls `condition` until it holds, panicking with `what` if it does not within `timeout`.
pub(crate) async fn wait_until(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
