//! The core machinery of a MongoDB client: topology monitoring, server selection, connection
//! pooling, command execution with retries, and cursors.
//!
//! # Overview
//!
//! A [`Client`] owns a background view of the deployment. Each known server is probed by its
//! own monitor task, and every probe result is merged into a [`TopologyDescription`] snapshot
//! that is replaced as a whole value on each update. Operations select a server from the latest
//! snapshot according to their [`SelectionCriteria`](selection_criteria::SelectionCriteria),
//! lease a connection from that server's pool, and run a command over it.
//!
//! ```no_run
//! # use mongodb_driver_core::{bson::doc, error::Result, Client};
//! # async fn run() -> Result<()> {
//! let client = Client::with_uri_str("mongodb://localhost:27017/?replicaSet=rs0").await?;
//!
//! let reply = client
//!     .run_command("admin", doc! { "ping": 1 }, None)
//!     .await?;
//! println!("{}", reply);
//! # Ok(())
//! # }
//! ```
//!
//! # Cursors
//!
//! Queries return a [`Cursor`], which buffers one batch at a time and transparently issues
//! `getMore` commands as the buffer drains. Position handles obtained from
//! [`Cursor::begin`] share the cursor's single position, so advancing one handle is observed
//! by every other live handle.
//!
//! ```no_run
//! # use mongodb_driver_core::{bson::doc, error::Result, options::FindOptions, Client, Namespace};
//! # async fn run(client: Client) -> Result<()> {
//! let ns = Namespace::new("db", "log");
//! let mut cursor = client.find(ns, doc! {}, FindOptions::default()).await?;
//! while cursor.advance().await? {
//!     println!("{:?}", cursor.current());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Logging
//!
//! Lifecycle events are emitted through [`tracing`](https://docs.rs/tracing) under the targets
//! `mongodb_driver_core::command`, `mongodb_driver_core::connection`,
//! `mongodb_driver_core::server_selection`, `mongodb_driver_core::topology` and
//! `mongodb_driver_core::cursor`.

#![warn(missing_docs)]
#![allow(clippy::unreadable_literal, clippy::cognitive_complexity)]

pub mod options;

pub use ::bson;

mod bson_util;
mod client;
mod cmap;
mod cursor;
pub mod error;
pub mod event;
mod hello;
mod operation;
pub(crate) mod runtime;
mod sdam;
pub mod selection_criteria;
mod serde_util;
#[cfg(test)]
mod test;
mod trace;

pub use crate::{
    client::{
        auth::{AuthExchange, AuthProvider, Credential},
        session::{ClientSession, ClusterTime},
        Client,
    },
    cursor::{Cursor, CursorHandle, CursorStatus},
    operation::{InsertResult, Namespace},
    runtime::{AsyncStream, StreamConnector, TcpConnector},
};

pub use sdam::public::*;
