//! Named locks and schema versions coordinating DDL across workers.
//!
//! The core only sees the trait: a single-node deployment backs it with the
//! in-process service in [`memory`], a clustered deployment backs the same
//! interface with a lease-based KV store.

pub mod memory;

pub use memory::InMemoryCoordination;

use async_trait::async_trait;

use crate::error::IngestResult;

/// Number of acquisition attempts made by `try_lock` before giving up.
pub const TRY_LOCK_ATTEMPTS: u32 = 3;

/// Base delay between `try_lock` attempts; doubles per attempt.
pub const TRY_LOCK_BASE_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Coordination service: named locks per `(system, collection)` pair plus a
/// monotonically increasing schema version per pair.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Acquires the named lock, retrying until it succeeds.
    async fn lock(&self, system: &str, collection: &str) -> IngestResult<LockGuard>;

    /// Acquires the named lock with a bounded retry budget
    /// ([`TRY_LOCK_ATTEMPTS`] attempts, exponential backoff from
    /// [`TRY_LOCK_BASE_DELAY`]); fails with `LockTimeout` when exhausted.
    async fn try_lock(&self, system: &str, collection: &str) -> IngestResult<LockGuard>;

    /// Bumps and returns the version of the pair. Called after successful
    /// DDL so other workers invalidate their cached schemas.
    async fn increment_version(&self, system: &str, collection: &str) -> IngestResult<i64>;

    /// Current version of the pair; 0 when never incremented.
    async fn get_version(&self, system: &str, collection: &str) -> IngestResult<i64>;
}

/// An acquired named lock. Released on drop, on every exit path including
/// panics.
pub struct LockGuard {
    identifier: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(identifier: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            identifier: identifier.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// Canonical lock/version key of a `(system, collection)` pair.
pub fn identifier(system: &str, collection: &str) -> String {
    format!("{system}_{collection}")
}
