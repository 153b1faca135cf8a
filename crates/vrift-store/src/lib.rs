//! # vrift-store
//!
//! The content store a build step talks to: a [`LocalStore`] cache in front
//! of an optional [`RemoteStore`].
//!
//! - Reads are read-through: local first, then remote, populating local.
//! - Writes are local only; publishing to the remote is the explicit
//!   [`Store::upload_to_remote`].
//! - [`Store::garbage_collect`] applies the configured size budget.
//!
//! All disk work runs on the blocking pool, so no async worker waits on I/O.
//!
//! [`LocalStore`]: vrift_cas::LocalStore
//! [`RemoteStore`]: vrift_remote::RemoteStore

mod error;
mod store;

pub use error::{Result, StoreError};
pub use store::{Store, UploadSummary};
