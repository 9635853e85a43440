use std::{error, fmt, result};

/// Type alias for convenience when using the Result type with our error.
pub type IngestResult<T> = result::Result<T, IngestError>;

/// Internal error representation with kind, description and optional detail.
///
/// Uses boxing to keep the public error type size consistent and enable
/// rich error context without penalizing the success path.
struct ErrorInner {
    kind: ErrorKind,
    description: &'static str,
    detail: Option<String>,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Error classification for the ingestion pipeline.
///
/// Kinds are deliberately coarse: per-call context goes into the error
/// description and detail, while the kind drives routing decisions
/// (skip / requeue / fallback / abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Event must be skipped (missing event id, empty table name render).
    SkipObject,
    /// Derived header exceeds the configured column cap.
    MaxColumns,
    /// Field mapping or explicit cast failed.
    MappingFailed,
    /// Table name template could not be rendered.
    TemplateFailed,
    /// Invalid configuration or credentials; fatal at destination init.
    ValidationFailed,

    /// Network-level connection failure, retried by the streaming worker.
    ConnectionFailed,
    /// Operation timed out.
    TimedOut,
    /// SQL query execution failure.
    QueryFailed,
    /// DDL (CREATE/ALTER) execution failure.
    DdlFailed,
    /// Header and live table could not be reconciled.
    SchemaMismatch,

    /// HTTP API sink rejected the request permanently (4xx).
    ApiRejected,
    /// HTTP API sink throttled or failed transiently (429/5xx).
    ApiThrottled,

    /// Queue was closed while an operation was in flight.
    QueueClosed,
    /// Queue data directory is corrupt or unreadable.
    QueueCorrupted,

    /// Destination id is not present in the routing snapshot.
    DestinationNotFound,
    /// Destination exists but has not finished initializing.
    DestinationNotReady,
    /// Destination is staged (dry-run) and refuses writes.
    StagedDestination,

    /// Fallback file is already being replayed.
    FileAlreadyLocked,
    /// Staged or fallback file name does not match the expected pattern.
    MalformedFileName,
    /// Named lock could not be acquired within the retry budget.
    LockTimeout,

    /// Filesystem operation failure.
    Io,
    /// JSON (de)serialization failure.
    SerializationFailed,
    /// Error aggregating several underlying errors.
    Many,
    /// Error that doesn't fit other categories.
    Unknown,
}

/// A stable error type for the ingestion library.
///
/// Provides a stable public API while allowing internal error details to
/// evolve. Supports error chaining, a free-form detail string, and the
/// transiency classification used by the streaming worker.
pub struct IngestError(Box<ErrorInner>);

impl IngestError {
    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns the static description of the error.
    pub fn description(&self) -> &'static str {
        self.0.description
    }

    /// Returns the dynamic detail of the error, if any.
    pub fn detail(&self) -> Option<&str> {
        self.0.detail.as_deref()
    }

    /// Attaches a source error, preserving kind, description and detail.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        self.0.source = Some(source.into());
        self
    }

    /// Aggregates several errors into a single [`ErrorKind::Many`] error.
    pub fn from_many(errors: Vec<IngestError>, description: &'static str) -> Self {
        let errors = Errors(errors);
        let detail = errors.to_string();
        IngestError::from((ErrorKind::Many, description, detail)).with_source(errors)
    }

    /// Returns true when the error should be retried in place rather than
    /// routed to the fallback log.
    ///
    /// Two classifications are combined: structured kinds coming from the
    /// adapters (connection failures, timeouts, API throttling), and the
    /// substring set the SQL drivers surface for broken connections. The
    /// substring test is applied to the full rendered error, source included.
    pub fn is_transient(&self) -> bool {
        match self.0.kind {
            ErrorKind::ConnectionFailed | ErrorKind::TimedOut | ErrorKind::ApiThrottled => {
                return true;
            }
            ErrorKind::ApiRejected
            | ErrorKind::SkipObject
            | ErrorKind::MaxColumns
            | ErrorKind::MappingFailed
            | ErrorKind::TemplateFailed
            | ErrorKind::ValidationFailed => return false,
            _ => {}
        }

        let rendered = self.to_string().to_lowercase();
        TRANSIENT_MARKERS
            .iter()
            .any(|marker| rendered.contains(marker))
    }
}

/// Substrings of driver errors that indicate a broken connection rather than
/// a bad statement, matched case-insensitively against the rendered error.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "eof",
    "broken pipe",
    "context deadline exceeded",
    "connection reset",
];

impl From<(ErrorKind, &'static str)> for IngestError {
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        IngestError(Box::new(ErrorInner {
            kind,
            description,
            detail: None,
            source: None,
        }))
    }
}

impl From<(ErrorKind, &'static str, String)> for IngestError {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> Self {
        IngestError(Box::new(ErrorInner {
            kind,
            description,
            detail: Some(detail),
            source: None,
        }))
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.description)?;
        if let Some(detail) = &self.0.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(source) = &self.0.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestError")
            .field("kind", &self.0.kind)
            .field("description", &self.0.description)
            .field("detail", &self.0.detail)
            .field("source", &self.0.source)
            .finish()
    }
}

impl error::Error for IngestError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn error::Error + 'static))
    }
}

/// A collection of errors surfaced together, e.g. by a partially failed
/// replay where several tables errored independently.
pub struct Errors(Vec<IngestError>);

impl From<Vec<IngestError>> for Errors {
    fn from(value: Vec<IngestError>) -> Self {
        Errors(value)
    }
}

impl fmt::Debug for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Errors")
            .field("count", &self.0.len())
            .field("errors", &self.0)
            .finish()
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.0[0]),
            count => {
                write!(f, "{count} errors: ")?;
                for (i, error) in self.0.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{error}")?;
                }
                Ok(())
            }
        }
    }
}

impl error::Error for Errors {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        // Only the first error can be exposed through the std source chain.
        self.0.first().and_then(|err| err.source())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest_error;

    #[test]
    fn transient_kinds_are_transient() {
        let err = ingest_error!(ErrorKind::ConnectionFailed, "Sink unreachable");
        assert!(err.is_transient());

        let err = ingest_error!(ErrorKind::ApiThrottled, "429 from conversion API");
        assert!(err.is_transient());
    }

    #[test]
    fn permanent_kinds_are_not_transient() {
        let err = ingest_error!(
            ErrorKind::QueryFailed,
            "Insert failed",
            "syntax error at or near \"VALUES\""
        );
        assert!(!err.is_transient());

        let err = ingest_error!(ErrorKind::ApiRejected, "400 from conversion API");
        assert!(!err.is_transient());
    }

    #[test]
    fn driver_substrings_mark_unknown_errors_transient() {
        for marker in [
            "connection refused",
            "unexpected EOF",
            "write: broken pipe",
            "context deadline exceeded",
            "connection reset by peer",
        ] {
            let err = ingest_error!(
                ErrorKind::QueryFailed,
                "Insert failed",
                format!("driver: {marker}")
            );
            assert!(err.is_transient(), "expected transient for {marker}");
        }
    }

    #[test]
    fn many_renders_every_error() {
        let errors = vec![
            ingest_error!(ErrorKind::QueryFailed, "Insert failed", "table a"),
            ingest_error!(ErrorKind::DdlFailed, "Patch failed", "table b"),
        ];
        let err = IngestError::from_many(errors, "Replay partially failed");
        assert_eq!(err.kind(), ErrorKind::Many);
        let rendered = err.to_string();
        assert!(rendered.contains("table a"));
        assert!(rendered.contains("table b"));
    }
}
