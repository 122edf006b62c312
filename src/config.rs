//! Store configuration.
//!
//! Every field has a default, so an empty TOML document (or
//! [`StoreConfig::default`]) yields a working in-memory store.
//!
//! ```toml
//! key_prefix = "@app:"
//! delimiter = "::"
//! legacy_delimiter = ":"
//! legacy_fallback = true
//! max_history_depth = 50
//! default_ttl_secs = 900
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse TOML content.
    #[error("failed to parse config TOML: {source}")]
    Toml {
        /// The underlying TOML parse error.
        #[from]
        source: toml::de::Error,
    },

    /// A value parsed but cannot be used.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix prepended to every physical storage key.
    pub key_prefix: String,
    /// Separator between scope and key in physical keys.
    pub delimiter: String,
    /// Separator used by the previous key scheme, if any data still uses it.
    pub legacy_delimiter: Option<String>,
    /// Try the legacy physical key when hydration misses.
    pub legacy_fallback: bool,
    /// Maximum undo depth per entry.
    pub max_history_depth: usize,
    /// TTL applied on write to keys without their own TTL.
    pub default_ttl_secs: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "@store:".to_owned(),
            delimiter: "::".to_owned(),
            legacy_delimiter: Some(":".to_owned()),
            legacy_fallback: true,
            max_history_depth: 50,
            default_ttl_secs: None,
        }
    }
}

impl StoreConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Reject configurations that would make physical keys ambiguous.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delimiter.is_empty() {
            return Err(ConfigError::Invalid("delimiter must not be empty".into()));
        }
        if let Some(legacy) = &self.legacy_delimiter {
            if legacy.is_empty() {
                return Err(ConfigError::Invalid(
                    "legacy_delimiter must not be empty".into(),
                ));
            }
            if legacy == &self.delimiter {
                return Err(ConfigError::Invalid(
                    "legacy_delimiter must differ from delimiter".into(),
                ));
            }
        }
        if self.max_history_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_history_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Default TTL as a [`Duration`].
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn partial_document_overrides() {
        let config = StoreConfig::from_toml_str(
            r#"
            key_prefix = "@app:"
            max_history_depth = 5
            default_ttl_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.key_prefix, "@app:");
        assert_eq!(config.max_history_depth, 5);
        assert_eq!(config.default_ttl(), Some(Duration::from_secs(30)));
        assert_eq!(config.delimiter, "::");
    }

    #[test]
    fn rejects_clashing_delimiters() {
        let err = StoreConfig::from_toml_str(
            r#"
            delimiter = ":"
            legacy_delimiter = ":"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_history() {
        let err = StoreConfig::from_toml_str("max_history_depth = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn reports_parse_errors() {
        let err = StoreConfig::from_toml_str("max_history_depth = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }
}
