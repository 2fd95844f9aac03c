//! Capability traits for the managed services the portal talks to, with
//! Google Cloud REST implementations.
//!
//! Every service is reached through a trait (`ObjectStore`, `Warehouse`,
//! `MessagePublisher`, `SqlImporter`) so callers receive `Arc<dyn ...>`
//! handles at construction time and tests can substitute the in-memory
//! fakes from [`testutils`].

pub mod auth;
pub mod bigquery;
pub mod cloudsql;
pub mod gcs;
pub mod metrics_defs;
pub mod object_store;
pub mod pubsub;
mod rest;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
pub mod warehouse;

pub use rest::RestError;
