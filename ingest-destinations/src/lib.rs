//! Sink adapters and per-destination storage wrappers.
//!
//! Each adapter module speaks one sink's wire protocol behind the
//! [`ingest::sink::SinkAdapter`] contract; [`storage::DestinationStorage`]
//! wraps an adapter with the processor, table helper and fallback surface;
//! [`factory::DestinationFactory`] builds the whole destination for the
//! router.

pub mod bigquery;
pub mod clickhouse;
pub mod facebook;
pub mod factory;
pub mod google_analytics;
pub mod mysql;
pub mod postgres;
pub mod redshift;
pub mod s3;
pub mod snowflake;
pub mod stage;
pub mod storage;
pub mod values;

pub use factory::DestinationFactory;
pub use storage::DestinationStorage;
