use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

/// Top-level service errors; any of them maps to a non-zero exit code.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ingest_config::LoadConfigError),

    #[error("configuration validation error: {0}")]
    Validation(#[from] ingest_config::ValidationError),

    #[error("initialization error: {0}")]
    Init(#[from] ingest::IngestError),

    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}
