//! Database configuration.

use crate::index::Language;
use std::env;
use std::path::PathBuf;

/// Where the store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreConfig {
    #[default]
    InMemory,
    File {
        path: PathBuf,
    },
}

/// Database configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Storage backend
    pub store: StoreConfig,
    /// Worker threads of the event runtime
    pub event_workers: usize,
    /// Stop word languages for full-text indexes
    pub text_languages: Vec<Language>,
    /// Commit after every write operation
    pub auto_commit: bool,
    /// Schema version the migration manager brings the store to
    pub schema_version: u32,
    /// Owner recorded in collection attributes
    pub node_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::InMemory,
            event_workers: 2,
            text_languages: vec![Language::English],
            auto_commit: false,
            schema_version: 1,
            node_id: "local".to_string(),
        }
    }
}

impl Config {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::File { path: path.into() },
            ..Self::default()
        }
    }

    pub fn with_event_workers(mut self, workers: usize) -> Self {
        self.event_workers = workers;
        self
    }

    pub fn with_text_languages(mut self, languages: Vec<Language>) -> Self {
        self.text_languages = languages;
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Load configuration from environment variables.
    ///
    /// - `SALTPETER_STORE_PATH`: file store path; in-memory when unset
    /// - `SALTPETER_EVENT_WORKERS`: event runtime threads (default 2)
    /// - `SALTPETER_AUTO_COMMIT`: `true`/`false` (default false)
    /// - `SALTPETER_TEXT_LANGUAGES`: comma separated, e.g. `english,french`
    /// - `SALTPETER_NODE_ID`: owner name (default `local`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let store = match lookup("SALTPETER_STORE_PATH") {
            Some(path) if path.trim().is_empty() => return Err(ConfigError::EmptyStorePath),
            Some(path) => StoreConfig::File { path: path.into() },
            None => StoreConfig::InMemory,
        };

        let event_workers = match lookup("SALTPETER_EVENT_WORKERS") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidEventWorkers(raw)),
            },
            None => defaults.event_workers,
        };

        let auto_commit = match lookup("SALTPETER_AUTO_COMMIT") {
            Some(raw) => raw
                .trim()
                .parse::<bool>()
                .map_err(|_| ConfigError::InvalidAutoCommit(raw))?,
            None => defaults.auto_commit,
        };

        let text_languages = match lookup("SALTPETER_TEXT_LANGUAGES") {
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<Language>().map_err(ConfigError::InvalidLanguage))
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.text_languages,
        };

        let node_id = lookup("SALTPETER_NODE_ID").unwrap_or(defaults.node_id);

        Ok(Self {
            store,
            event_workers,
            text_languages,
            auto_commit,
            schema_version: defaults.schema_version,
            node_id,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SALTPETER_STORE_PATH cannot be empty")]
    EmptyStorePath,

    #[error("Invalid SALTPETER_EVENT_WORKERS value: {0}")]
    InvalidEventWorkers(String),

    #[error("Invalid SALTPETER_AUTO_COMMIT value: {0}")]
    InvalidAutoCommit(String),

    #[error("Invalid SALTPETER_TEXT_LANGUAGES entry: {0}")]
    InvalidLanguage(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn reads_all_variables() {
        let config = Config::from_lookup(lookup(&[
            ("SALTPETER_STORE_PATH", "/tmp/db.json"),
            ("SALTPETER_EVENT_WORKERS", "4"),
            ("SALTPETER_AUTO_COMMIT", "true"),
            ("SALTPETER_TEXT_LANGUAGES", "english, french"),
            ("SALTPETER_NODE_ID", "node-7"),
        ]))
        .unwrap();

        assert_eq!(
            config.store,
            StoreConfig::File {
                path: "/tmp/db.json".into()
            }
        );
        assert_eq!(config.event_workers, 4);
        assert!(config.auto_commit);
        assert_eq!(config.text_languages, vec![Language::English, Language::French]);
        assert_eq!(config.node_id, "node-7");
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(
            Config::from_lookup(lookup(&[("SALTPETER_EVENT_WORKERS", "0")])),
            Err(ConfigError::InvalidEventWorkers("0".into()))
        );
        assert_eq!(
            Config::from_lookup(lookup(&[("SALTPETER_AUTO_COMMIT", "yes")])),
            Err(ConfigError::InvalidAutoCommit("yes".into()))
        );
        assert!(matches!(
            Config::from_lookup(lookup(&[("SALTPETER_TEXT_LANGUAGES", "klingon")])),
            Err(ConfigError::InvalidLanguage(_))
        ));
        assert_eq!(
            Config::from_lookup(lookup(&[("SALTPETER_STORE_PATH", " ")])),
            Err(ConfigError::EmptyStorePath)
        );
    }

    #[test]
    fn builder() {
        let config = Config::file("data.json")
            .with_auto_commit(true)
            .with_schema_version(3)
            .with_node_id("n1");
        assert!(matches!(config.store, StoreConfig::File { .. }));
        assert_eq!(config.schema_version, 3);
        assert_eq!(config.node_id, "n1");
    }
}
