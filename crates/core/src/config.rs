//! Configuration surface (spec §6 "Configuration surface").
//!
//! Sources merge by precedence (highest first): runtime overrides > user
//! config > defaults. Grounded on `codescope::init.rs`'s use of
//! `toml::Table` for structural pre-validation before committing to a typed
//! `serde` parse, so unknown keys are rejected with the offending key name
//! rather than silently ignored by `#[serde(deny_unknown_fields)]` alone
//! (which would only report the first one encountered).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FolderConfig {
    pub path: PathBuf,
    pub model: String,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProcessingConfig {
    pub batch_size: u32,
    pub max_concurrent_operations: u32,
    pub chunk_size: u32,
    pub overlap: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self { batch_size: 16, max_concurrent_operations: 3, chunk_size: 500, overlap: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelRegistryConfig {
    pub capacity: u32,
}

impl Default for ModelRegistryConfig {
    fn default() -> Self {
        Self { capacity: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AutoRestartConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub delay: u32,
    pub max_delay: u32,
    pub exponential_backoff: bool,
}

impl Default for AutoRestartConfig {
    fn default() -> Self {
        Self { enabled: true, max_retries: 5, delay: 1, max_delay: 30, exponential_backoff: true }
    }
}

/// The auxiliary child process the supervisor (§4.J) manages — "the
/// component that speaks the external tool protocol" named in §1. An empty
/// `command` means there is no child to supervise; the daemon then runs
/// without a process supervisor rather than failing to start one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SupervisorConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { command: String::new(), args: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WatcherConfig {
    pub debounce_delay: u32,
    pub use_polling: bool,
    pub interval: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_delay: 500, use_polling: false, interval: 1000 }
    }
}

/// The fully merged, typed configuration (§6 "recognized keys" table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DaemonConfig {
    pub folders: Vec<FolderConfig>,
    pub processing: ProcessingConfig,
    pub model_registry: ModelRegistryConfig,
    pub auto_restart: AutoRestartConfig,
    pub shutdown_timeout: u32,
    pub shutdown_signal: String,
    pub reload_signal: String,
    pub watcher: WatcherConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            processing: ProcessingConfig::default(),
            model_registry: ModelRegistryConfig::default(),
            auto_restart: AutoRestartConfig::default(),
            shutdown_timeout: 10,
            shutdown_signal: "SIGTERM".to_string(),
            reload_signal: "SIGHUP".to_string(),
            watcher: WatcherConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Range-check numeric keys per §6: chunk size 200-1000, batch size
    /// 1-128, worker count 1-16.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("processing.chunkSize", self.processing.chunk_size, 200, 1000)?;
        check_range("processing.batchSize", self.processing.batch_size, 1, 128)?;
        check_range(
            "processing.maxConcurrentOperations",
            self.processing.max_concurrent_operations,
            1,
            16,
        )?;
        if self.model_registry.capacity == 0 {
            return Err(ConfigError::OutOfRange {
                key: "modelRegistry.capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn check_range(key: &str, value: u32, min: u32, max: u32) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key: key.to_string(),
            message: format!("invalid {value} (must be {min}-{max})"),
        });
    }
    Ok(())
}

/// Load a user config file from disk, rejecting unknown top-level and
/// nested keys before the typed parse runs. Mirrors `codescope::init.rs`'s
/// "inspect as a generic table, then commit to the typed shape" sequence.
pub fn load_user_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    parse_user_config(&raw)
}

/// Parse and validate a user config document from an in-memory string.
pub fn parse_user_config(raw: &str) -> Result<DaemonConfig, ConfigError> {
    let table: toml::Table = raw.parse().map_err(ConfigError::Parse)?;
    reject_unknown_keys(&table, &known_top_level_keys(), "")?;
    let config: DaemonConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

fn known_top_level_keys() -> [&'static str; 9] {
    [
        "folders",
        "processing",
        "model_registry",
        "auto_restart",
        "shutdown_timeout",
        "shutdown_signal",
        "reload_signal",
        "watcher",
        "supervisor",
    ]
}

fn reject_unknown_keys(table: &toml::Table, known: &[&str], prefix: &str) -> Result<(), ConfigError> {
    for key in table.keys() {
        if !known.contains(&key.as_str()) {
            return Err(ConfigError::UnknownKey(format!("{prefix}{key}")));
        }
    }
    Ok(())
}

/// Overlay `override_cfg` on top of `base`: any non-default scalar in the
/// override wins. Implements the "runtime overrides > user config >
/// defaults" precedence as plain struct-field overlay rather than untyped
/// map merge (§9 re-architecture of dynamic typing).
pub fn merge(defaults: DaemonConfig, user: Option<DaemonConfig>, overrides: Option<DaemonConfig>) -> DaemonConfig {
    let mut merged = defaults;
    if let Some(user) = user {
        merged = overlay(merged, user);
    }
    if let Some(overrides) = overrides {
        merged = overlay(merged, overrides);
    }
    merged
}

fn overlay(base: DaemonConfig, over: DaemonConfig) -> DaemonConfig {
    DaemonConfig {
        folders: if over.folders.is_empty() { base.folders } else { over.folders },
        processing: over.processing,
        model_registry: over.model_registry,
        auto_restart: over.auto_restart,
        shutdown_timeout: over.shutdown_timeout,
        shutdown_signal: over.shutdown_signal,
        reload_signal: over.reload_signal,
        watcher: over.watcher,
        supervisor: over.supervisor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(DaemonConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_chunk_size_is_rejected() {
        let mut cfg = DaemonConfig::default();
        cfg.processing.chunk_size = 50;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn unknown_top_level_key_is_rejected_with_name() {
        let raw = r#"
            bogus_key = true
        "#;
        let err = parse_user_config(raw).unwrap_err();
        match err {
            ConfigError::UnknownKey(key) => assert_eq!(key, "bogus_key"),
            other => panic!("expected UnknownKey, got {other:?}"),
        }
    }

    #[test]
    fn valid_user_config_parses() {
        let raw = r#"
            [[folders]]
            path = "/tmp/docs"
            model = "bge-small"

            [processing]
            chunk_size = 400
            overlap = 40
            batch_size = 16
            max_concurrent_operations = 3
        "#;
        let cfg = parse_user_config(raw).unwrap();
        assert_eq!(cfg.folders.len(), 1);
        assert_eq!(cfg.processing.chunk_size, 400);
    }

    #[test]
    fn supervisor_command_is_unset_by_default() {
        assert!(DaemonConfig::default().supervisor.command.is_empty());
    }

    #[test]
    fn supervisor_key_parses() {
        let raw = r#"
            [supervisor]
            command = "folderd-stdio"
            args = ["--once"]
        "#;
        let cfg = parse_user_config(raw).unwrap();
        assert_eq!(cfg.supervisor.command, "folderd-stdio");
        assert_eq!(cfg.supervisor.args, vec!["--once".to_string()]);
    }

    #[test]
    fn merge_prefers_overrides_over_user_over_defaults() {
        let defaults = DaemonConfig::default();
        let mut user = DaemonConfig::default();
        user.shutdown_timeout = 20;
        let mut overrides = DaemonConfig::default();
        overrides.shutdown_timeout = 99;

        let merged = merge(defaults, Some(user), Some(overrides));
        assert_eq!(merged.shutdown_timeout, 99);
    }
}
