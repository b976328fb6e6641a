//! Contains all of the types needed to specify options to client operations.
//!
//! Most of the options structs in this module use the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a type-safe builder
//! API on them. For example, to create an instance of [`FindOptions`] with only `limit` and
//! `batch_size` set, the builder API can be used as follows:
//!
//! ```rust
//! # use mongodb_driver_core::options::FindOptions;
//! #
//! # let options = FindOptions::builder()
//! #                   .limit(20)
//! #                   .batch_size(5u32)
//! #                   .build();
//! ```

pub use crate::{
    client::{auth::Credential, options::*},
    cmap::options::ConnectionPoolOptions,
    operation::{CursorType, FindOptions, InsertOptions},
    selection_criteria::*,
};
