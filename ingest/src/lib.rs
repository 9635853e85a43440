//! Core of the event ingestion and fan-out pipeline.
//!
//! The crate owns everything between an accepted event and a sink adapter
//! call: the processor that flattens and types events, the table helper
//! that reconciles sink schemas under a named lock, the persistent queue
//! and the streaming/batch workers draining it, the fallback surface, the
//! per-destination events cache, and the token router.
//!
//! Sink adapters themselves (Postgres, ClickHouse, BigQuery, ...) live in
//! the `ingest-destinations` crate and implement the contracts in
//! [`sink`].

pub mod cache;
pub mod concurrency;
pub mod coordination;
pub mod enrichment;
pub mod error;
pub mod fallback;
pub mod logfiles;
pub mod macros;
pub mod queue;
pub mod routing;
pub mod schema;
pub mod sink;
pub mod table;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;

pub use error::{ErrorKind, IngestError, IngestResult};
