//! Configuration types and loading for the ingestion service.
//!
//! Everything the service reads from its configuration source lives here:
//! the server block, destination definitions with their per-sink credential
//! blocks, token registry, and the `CONFIG_LOCATION` resolution logic
//! (file path, URL with optional basic auth, or inline JSON).

pub mod destination;
pub mod load;
pub mod sensitive;
pub mod server;
pub mod tokens;

pub use destination::{
    ClickHouseConfig, ClickHouseEngineConfig, DataLayout, DataSourceConfig, DestinationConfig,
    DestinationMode, EnrichmentRuleConfig, FacebookConfig, FieldMappingAction,
    GoogleAnalyticsConfig, GoogleConfig, Mapping, MappingField, S3Config, SnowflakeConfig,
    UsersRecognition,
};
pub use load::{
    CONFIG_LOCATION_ENV, ConfigLocation, LoadConfigError, content_hash, load_config, parse_config,
    read_config_payload,
};
pub use sensitive::SensitiveString;
pub use server::{AppConfig, EventsLogConfig, GeoConfig, ServerConfig};
pub use tokens::{Token, TokensConfig};

/// Errors produced by `validate()` implementations on configuration types.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// A required field is missing from the configuration.
    #[error("configuration field `{field}` is required")]
    MissingField { field: String },

    /// A field is present but its value violates a constraint.
    #[error("configuration field `{field}` is invalid: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        ValidationError::InvalidFieldValue {
            field: field.into(),
            constraint: constraint.into(),
        }
    }
}
