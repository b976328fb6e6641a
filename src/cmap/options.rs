use std::time::Duration;

use serde::Serialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    event::{cmap::CmapEvent, EventHandler},
    options::ClientOptions,
    sdam::DEFAULT_SERVER_SELECTION_TIMEOUT,
    serde_util,
};

/// Contains the options for creating a connection pool.
#[skip_serializing_none]
#[derive(Clone, Default, Debug, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// Bound on checked-out plus idle connections. Zero removes the bound. Defaults to 10.
    pub max_pool_size: Option<u32>,

    /// The worker opens connections in the background until the pool holds at least this many,
    /// counting checked-out ones.
    pub min_pool_size: Option<u32>,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time`
    /// will not be used. A value of zero means connections are never considered idle.
    #[serde(
        rename = "maxIdleTimeMS",
        serialize_with = "serde_util::serialize_duration_option_as_int_millis"
    )]
    pub max_idle_time: Option<Duration>,

    /// How long a checkout waits for a connection to become available before failing with
    /// [`ErrorKind::WaitQueueTimeout`](crate::error::ErrorKind::WaitQueueTimeout). Pools built
    /// from client options fall back to the server selection timeout. If unset, checkouts wait
    /// indefinitely.
    #[serde(
        rename = "waitQueueTimeoutMS",
        serialize_with = "serde_util::serialize_duration_option_as_int_millis"
    )]
    pub wait_queue_timeout: Option<Duration>,

    /// The handler that pool and connection events are delivered to.
    #[serde(skip)]
    pub(crate) cmap_event_handler: Option<EventHandler<CmapEvent>>,

    /// Whether the pool starts out ready rather than paused.
    #[cfg(test)]
    #[serde(skip)]
    #[builder(setter(skip))]
    pub(crate) ready: Option<bool>,

    /// How often the background task prunes idle connections and tops up `min_pool_size`.
    #[cfg(test)]
    #[serde(skip)]
    #[builder(setter(skip))]
    pub(crate) maintenance_frequency: Option<Duration>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_idle_time: options.max_idle_time,
            wait_queue_timeout: options.wait_queue_timeout.or(Some(
                options
                    .server_selection_timeout
                    .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT),
            )),
            cmap_event_handler: options.cmap_event_handler.clone(),
            #[cfg(test)]
            ready: None,
            #[cfg(test)]
            maintenance_frequency: None,
        }
    }

    /// A copy of these options suitable for attaching to a `PoolCreatedEvent`.
    pub(crate) fn to_event_options(&self) -> Self {
        let mut options = self.clone();
        options.cmap_event_handler = None;
        options
    }
}
