//! Event log file plumbing shared by the fallback surface and the batch
//! uploader: naming conventions, rotation, archiving, and the per-file
//! upload status sidecars.

pub mod archive;
pub mod names;
pub mod status;
pub mod writer;

pub use archive::Archiver;
pub use names::{FALLBACK_PREFIX, FallbackFileName, StagedFileName};
pub use status::{StatusManager, TableStatus};
pub use writer::RotatingWriter;

/// Subdirectory of the events path holding fallback logs.
pub const FAILED_DIR: &str = "failed";
/// Subdirectory of the events path holding archived logs.
pub const ARCHIVE_DIR: &str = "archive";
/// Subdirectory of the events path holding per-destination batch staging.
pub const STAGING_DIR: &str = "staging";
