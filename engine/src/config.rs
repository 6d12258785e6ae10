//! Engine configuration.
//!
//! Everything has a default, so `EngineConfig::default()` gives an in-memory
//! small-tier store. Hosts usually call [`EngineConfig::from_env`].

use crate::adapter::{Availability, SizeClass};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Default key-value quota: 5 MiB.
pub const DEFAULT_KV_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Prefix for every persisted key
    pub namespace: String,
    /// Declared data-size class, drives adapter selection
    pub size_class: SizeClass,
    pub audit: AuditConfig,
    pub undo: UndoConfig,
    /// Byte quota of the key-value tier
    pub kv_quota_bytes: usize,
    /// Directory for the file-backed key-value tier; memory only when unset
    pub data_dir: Option<PathBuf>,
    /// SQLite URL of the indexed tier, e.g. `sqlite://data/records.db`
    pub indexed_url: Option<String>,
    /// Remote record API
    pub remote: Option<RemoteConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "groundwork".to_string(),
            size_class: SizeClass::default(),
            audit: AuditConfig::default(),
            undo: UndoConfig::default(),
            kv_quota_bytes: DEFAULT_KV_QUOTA_BYTES,
            data_dir: None,
            indexed_url: None,
            remote: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Entries kept after pruning
    pub max_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UndoConfig {
    pub enabled: bool,
    /// Commands kept on the undo stack
    pub max_depth: usize,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// Base URL of the record API, e.g. `http://localhost:3000`
    pub base_url: String,
    /// Per-request timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `GROUNDWORK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let size_class = match lookup("GROUNDWORK_SIZE_CLASS").as_deref() {
            None => defaults.size_class,
            Some("small") => SizeClass::Small,
            Some("large") => SizeClass::Large,
            Some("shared") => SizeClass::Shared,
            Some(other) => return Err(ConfigError::InvalidSizeClass(other.to_string())),
        };

        let remote = match lookup("GROUNDWORK_REMOTE_URL") {
            Some(base_url) => Some(RemoteConfig {
                base_url,
                timeout_ms: parse_var(&lookup, "GROUNDWORK_REMOTE_TIMEOUT_MS")?
                    .unwrap_or_else(default_timeout_ms),
            }),
            None => None,
        };

        Ok(Self {
            namespace: lookup("GROUNDWORK_NAMESPACE").unwrap_or(defaults.namespace),
            size_class,
            audit: AuditConfig {
                enabled: parse_var(&lookup, "GROUNDWORK_AUDIT_ENABLED")?
                    .unwrap_or(defaults.audit.enabled),
                max_entries: parse_var(&lookup, "GROUNDWORK_AUDIT_MAX_ENTRIES")?
                    .unwrap_or(defaults.audit.max_entries),
            },
            undo: UndoConfig {
                enabled: parse_var(&lookup, "GROUNDWORK_UNDO_ENABLED")?
                    .unwrap_or(defaults.undo.enabled),
                max_depth: parse_var(&lookup, "GROUNDWORK_UNDO_MAX_DEPTH")?
                    .unwrap_or(defaults.undo.max_depth),
            },
            kv_quota_bytes: parse_var(&lookup, "GROUNDWORK_KV_QUOTA_BYTES")?
                .unwrap_or(defaults.kv_quota_bytes),
            data_dir: lookup("GROUNDWORK_DATA_DIR").map(PathBuf::from),
            indexed_url: lookup("GROUNDWORK_INDEXED_URL"),
            remote,
        })
    }

    /// Backends this configuration can offer.
    pub fn availability(&self) -> Availability {
        Availability {
            indexed: self.indexed_url.is_some(),
            remote: self.remote.is_some(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid GROUNDWORK_SIZE_CLASS value: {0} (expected small, large or shared)")]
    InvalidSizeClass(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.audit.max_entries, 10_000);
        assert_eq!(config.undo.max_depth, 100);
        assert_eq!(config.kv_quota_bytes, 5 * 1024 * 1024);
        assert_eq!(config.availability(), Availability::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("GROUNDWORK_NAMESPACE", "site-7"),
            ("GROUNDWORK_SIZE_CLASS", "shared"),
            ("GROUNDWORK_AUDIT_ENABLED", "false"),
            ("GROUNDWORK_AUDIT_MAX_ENTRIES", "50"),
            ("GROUNDWORK_UNDO_MAX_DEPTH", "5"),
            ("GROUNDWORK_INDEXED_URL", "sqlite::memory:"),
            ("GROUNDWORK_REMOTE_URL", "http://localhost:3000"),
            ("GROUNDWORK_REMOTE_TIMEOUT_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.namespace, "site-7");
        assert_eq!(config.size_class, SizeClass::Shared);
        assert!(!config.audit.enabled);
        assert_eq!(config.audit.max_entries, 50);
        assert_eq!(config.undo.max_depth, 5);
        assert!(config.undo.enabled);
        assert_eq!(
            config.remote,
            Some(RemoteConfig {
                base_url: "http://localhost:3000".into(),
                timeout_ms: 250
            })
        );
        assert!(config.availability().indexed && config.availability().remote);
    }

    #[test]
    fn rejects_bad_values() {
        let err = EngineConfig::from_lookup(lookup(&[("GROUNDWORK_UNDO_MAX_DEPTH", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "GROUNDWORK_UNDO_MAX_DEPTH", .. }));

        let err = EngineConfig::from_lookup(lookup(&[("GROUNDWORK_SIZE_CLASS", "huge")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSizeClass(ref v) if v == "huge"));
    }

    #[test]
    fn deserializes_partial_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"namespace": "hq", "undo": {"maxDepth": 3}, "remote": {"baseUrl": "http://api"}}"#,
        )
        .unwrap();
        assert_eq!(config.namespace, "hq");
        assert_eq!(config.undo.max_depth, 3);
        assert!(config.undo.enabled);
        assert_eq!(config.remote.unwrap().timeout_ms, 10_000);
    }
}
