//! Per-destination driver tasks: the streaming worker draining a persistent
//! queue, and the batch worker uploading staged files on a tick.

pub mod batch;
pub mod streaming;

pub use batch::BatchWorker;
pub use streaming::StreamingWorker;
