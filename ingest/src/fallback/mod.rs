//! The fallback surface: async append-only loggers for events the pipeline
//! could not deliver, and the operator-initiated replay path that feeds
//! them back through a destination.

pub mod logger;
pub mod replay;

pub use logger::{AsyncLogger, DEFAULT_CHANNEL_CAPACITY};
pub use replay::FallbackService;
