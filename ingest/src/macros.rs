//! Utility macros for error handling.
//!
//! These macros provide a concise way to create and return
//! [`crate::error::IngestError`] instances with consistent formatting.

/// Creates an [`crate::error::IngestError`] from an error kind and
/// description, with an optional dynamic detail.
///
/// # Examples
/// ```rust,ignore
/// let error = ingest_error!(ErrorKind::ValidationFailed, "Port is required");
///
/// let error = ingest_error!(
///     ErrorKind::MappingFailed,
///     "Cast failed",
///     format!("cannot cast {} to bigint", value)
/// );
/// ```
#[macro_export]
macro_rules! ingest_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::IngestError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::IngestError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns an [`crate::error::IngestError`] from the current
/// function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::ingest_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::ingest_error!($kind, $desc, $detail))
    };
}
