use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::destination::{DestinationConfig, UsersRecognition};
use crate::tokens::TokensConfig;
use crate::ValidationError;

/// Top-level application configuration, deserialized from the resolved
/// `CONFIG_LOCATION` payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Event log directory settings (queues, staging, fallback, archive).
    #[serde(default)]
    pub log: EventsLogConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    /// Global users-recognition defaults, overridable per destination.
    #[serde(default)]
    pub users_recognition: Option<UsersRecognition>,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
    #[serde(default)]
    pub tokens: TokensConfig,
    /// Global cap on physical columns, overridable per destination.
    #[serde(default = "default_max_columns")]
    pub max_columns: usize,
}

impl AppConfig {
    pub const DEFAULT_MAX_COLUMNS: usize = 100;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.destinations.is_empty() {
            return Err(ValidationError::missing("destinations"));
        }
        if let Some(ur) = &self.users_recognition {
            ur.validate()?;
        }
        Ok(())
    }
}

fn default_max_columns() -> usize {
    AppConfig::DEFAULT_MAX_COLUMNS
}

/// Server identity and HTTP settings. The HTTP front door itself lives
/// outside this workspace; the settings are carried for the components that
/// name files and logs after the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub log: ServerLogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            port: default_port(),
            public_url: None,
            log: ServerLogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Applies the `PORT` environment override, when present and parseable.
    pub fn with_port_override(mut self) -> Self {
        if let Ok(port) = std::env::var("PORT")
            && let Ok(port) = port.parse()
        {
            self.port = port;
        }
        self
    }
}

fn default_server_name() -> String {
    "ingest-server".to_owned()
}

fn default_port() -> u16 {
    8001
}

/// Rotation settings of the application log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerLogConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_rotation_min")]
    pub rotation_min: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl Default for ServerLogConfig {
    fn default() -> Self {
        Self {
            path: None,
            rotation_min: default_rotation_min(),
            max_backups: default_max_backups(),
        }
    }
}

fn default_rotation_min() -> u64 {
    5
}

fn default_max_backups() -> usize {
    20
}

/// Root directory and rotation settings of the event logs. Queues, batch
/// staging, fallback and archive directories all live under `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsLogConfig {
    #[serde(default = "default_events_path")]
    pub path: String,
    #[serde(default = "default_rotation_min")]
    pub rotation_min: u64,
}

impl Default for EventsLogConfig {
    fn default() -> Self {
        Self {
            path: default_events_path(),
            rotation_min: default_rotation_min(),
        }
    }
}

fn default_events_path() -> String {
    "./events".to_owned()
}

/// Path to the MaxMind database consumed by the IP enrichment rule.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeoConfig {
    #[serde(default)]
    pub maxmind_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let yaml = r#"
destinations:
  pg_main:
    type: postgres
    datasource:
      host: localhost
      db: events
      username: ingest
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.server.name, "ingest-server");
        assert_eq!(cfg.server.port, 8001);
        assert_eq!(cfg.log.path, "./events");
        assert_eq!(cfg.max_columns, AppConfig::DEFAULT_MAX_COLUMNS);
        assert!(cfg.destinations.contains_key("pg_main"));
    }

    #[test]
    fn empty_destinations_fail_validation() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_err());
    }
}
