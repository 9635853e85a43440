//! Worker coordination primitives.

pub mod shutdown;

pub use shutdown::{ShutdownRx, ShutdownTx, create_shutdown, is_shutting_down};
