//! Entry addressing and physical storage keys.
//!
//! A physical key is `prefix + scope + delimiter + key`. Decoding splits on
//! the *last* delimiter, since scopes (e.g. `route:/quiz`) are more likely to
//! carry separator characters than keys are.

use std::fmt;

use crate::config::StoreConfig;

/// Address of one entry: a key within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    scope: String,
    key: String,
}

impl EntryKey {
    /// Create an entry address.
    pub fn new(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
        }
    }

    /// The scope half.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The key half.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.key)
    }
}

/// Encodes entry addresses into physical storage keys and back.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
    delimiter: String,
    legacy_delimiter: Option<String>,
}

impl KeyCodec {
    /// Build a codec from store configuration.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            prefix: config.key_prefix.clone(),
            delimiter: config.delimiter.clone(),
            legacy_delimiter: config.legacy_delimiter.clone(),
        }
    }

    /// Physical key under the current scheme.
    pub fn encode(&self, entry: &EntryKey) -> String {
        format!(
            "{}{}{}{}",
            self.prefix, entry.scope, self.delimiter, entry.key
        )
    }

    /// Physical key under the legacy scheme, if one is configured.
    pub fn encode_legacy(&self, entry: &EntryKey) -> Option<String> {
        self.legacy_delimiter
            .as_ref()
            .map(|legacy| format!("{}{}{}{}", self.prefix, entry.scope, legacy, entry.key))
    }

    /// Decode a physical key written under either scheme.
    ///
    /// Returns `None` for keys outside this store's prefix.
    pub fn decode(&self, physical: &str) -> Option<EntryKey> {
        let rest = physical.strip_prefix(&self.prefix)?;
        if let Some((scope, key)) = rest.rsplit_once(self.delimiter.as_str()) {
            return Some(EntryKey::new(scope, key));
        }
        let legacy = self.legacy_delimiter.as_deref()?;
        rest.rsplit_once(legacy)
            .map(|(scope, key)| EntryKey::new(scope, key))
    }

    /// Whether a physical key belongs to this store at all.
    pub fn owns(&self, physical: &str) -> bool {
        physical.starts_with(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> KeyCodec {
        KeyCodec::from_config(&StoreConfig::default())
    }

    #[test]
    fn encodes_current_and_legacy() {
        let entry = EntryKey::new("signup_flow", "signup");
        assert_eq!(codec().encode(&entry), "@store:signup_flow::signup");
        assert_eq!(
            codec().encode_legacy(&entry).as_deref(),
            Some("@store:signup_flow:signup")
        );
    }

    #[test]
    fn decodes_both_schemes() {
        let codec = codec();
        assert_eq!(
            codec.decode("@store:route:/quiz::list"),
            Some(EntryKey::new("route:/quiz", "list"))
        );
        assert_eq!(
            codec.decode("@store:signup_flow:signup"),
            Some(EntryKey::new("signup_flow", "signup"))
        );
    }

    #[test]
    fn ignores_foreign_keys() {
        assert_eq!(codec().decode("other:thing::x"), None);
        assert!(!codec().owns("other:thing::x"));
    }

    #[test]
    fn no_legacy_scheme() {
        let config = StoreConfig {
            legacy_delimiter: None,
            ..StoreConfig::default()
        };
        let codec = KeyCodec::from_config(&config);
        assert_eq!(codec.encode_legacy(&EntryKey::new("a", "b")), None);
        assert_eq!(codec.decode("@store:a:b"), None);
    }
}
