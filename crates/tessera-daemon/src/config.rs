//! Daemon configuration.
//!
//! Read from `$TESSERA_DATA_DIR/config.toml` (or the platform data directory).
//! Every field has a default, so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_keys::LifecycleConfig;
use tessera_ledger::SealerConfig;
use tessera_ratchet::RatchetConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TESSERA_DATA_DIR";

/// Environment variable carrying the master-key passphrase.
pub const PASSPHRASE_ENV: &str = "TESSERA_PASSPHRASE";

const CONFIG_FILE_NAME: &str = "config.toml";
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub ratchet: RatchetSettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
}

/// Key lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_rotation_interval_days")]
    pub rotation_interval_days: u64,
    /// How long a deprecated key version stays readable.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_max_key_age_days")]
    pub max_key_age_days: u64,
    /// Rotation scheduler tick.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_audit_log_capacity")]
    pub audit_log_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatchetSettings {
    #[serde(default = "default_dh_ratchet_interval")]
    pub dh_ratchet_interval: u64,
    #[serde(default = "default_max_skip")]
    pub max_skip: u64,
    #[serde(default = "default_max_skipped_keys")]
    pub max_skipped_keys: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSettings {
    #[serde(default = "default_min_witnesses")]
    pub min_witnesses: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions

fn default_rotation_interval_days() -> u64 {
    90
}

fn default_retention_days() -> u64 {
    30
}

fn default_max_key_age_days() -> u64 {
    365
}

fn default_check_interval_secs() -> u64 {
    60 * 60
}

fn default_audit_log_capacity() -> usize {
    tessera_keys::audit::DEFAULT_CAPACITY
}

fn default_dh_ratchet_interval() -> u64 {
    RatchetConfig::default().dh_ratchet_interval
}

fn default_max_skip() -> u64 {
    RatchetConfig::default().max_skip
}

fn default_max_skipped_keys() -> usize {
    RatchetConfig::default().max_skipped_keys
}

fn default_min_witnesses() -> usize {
    SealerConfig::default().min_witnesses
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            rotation_interval_days: default_rotation_interval_days(),
            retention_days: default_retention_days(),
            max_key_age_days: default_max_key_age_days(),
            check_interval_secs: default_check_interval_secs(),
            audit_log_capacity: default_audit_log_capacity(),
        }
    }
}

impl Default for RatchetSettings {
    fn default() -> Self {
        Self {
            dh_ratchet_interval: default_dh_ratchet_interval(),
            max_skip: default_max_skip(),
            max_skipped_keys: default_max_skipped_keys(),
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            min_witnesses: default_min_witnesses(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load from the default location, falling back to defaults if the file
    /// does not exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&default_data_dir().join(CONFIG_FILE_NAME))
    }

    /// Load from an explicit file path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component could run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ledger.min_witnesses == 0 {
            anyhow::bail!("ledger.min_witnesses must be at least 1");
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            rotation_interval: days(self.keys.rotation_interval_days),
            retention_window: days(self.keys.retention_days),
            max_key_age: days(self.keys.max_key_age_days),
            audit_capacity: self.keys.audit_log_capacity,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.keys.check_interval_secs.max(1))
    }

    pub fn ratchet(&self) -> RatchetConfig {
        RatchetConfig {
            dh_ratchet_interval: self.ratchet.dh_ratchet_interval,
            max_skip: self.ratchet.max_skip,
            max_skipped_keys: self.ratchet.max_skipped_keys,
            ..RatchetConfig::default()
        }
    }

    pub fn sealer(&self) -> SealerConfig {
        SealerConfig {
            min_witnesses: self.ledger.min_witnesses,
            ..SealerConfig::default()
        }
    }
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n * SECS_PER_DAY)
}

/// `$TESSERA_DATA_DIR`, else a per-user directory.
fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    #[cfg(target_os = "macos")]
    {
        dirs_fallback("Library/Application Support/Tessera")
    }
    #[cfg(not(target_os = "macos"))]
    {
        dirs_fallback(".tessera")
    }
}

/// Fallback home directory resolution.
fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/tessera"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.keys.rotation_interval_days, 90);
        assert_eq!(config.keys.retention_days, 30);
        assert_eq!(config.ratchet.dh_ratchet_interval, 100);
        assert_eq!(config.ratchet.max_skip, 1000);
        assert_eq!(config.ledger.min_witnesses, 2);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [keys]
            rotation_interval_days = 7

            [ledger]
            min_witnesses = 3
            "#,
        )
        .expect("parse");
        assert_eq!(config.keys.rotation_interval_days, 7);
        assert_eq!(config.keys.retention_days, 30);
        assert_eq!(config.ledger.min_witnesses, 3);
        assert_eq!(config.ratchet, RatchetSettings::default());
        assert_eq!(config.lifecycle().rotation_interval, Duration::from_secs(7 * SECS_PER_DAY));
        assert_eq!(config.sealer().min_witnesses, 3);
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert_eq!(DaemonConfig::load_from(&path).expect("missing"), DaemonConfig::default());

        std::fs::write(&path, "[ratchet]\nmax_skip = 50\n").expect("write");
        let config = DaemonConfig::load_from(&path).expect("load");
        assert_eq!(config.ratchet().max_skip, 50);
        assert_eq!(config.ratchet().retained_dh_keys, 4);
    }

    #[test]
    fn test_zero_min_witnesses_rejected_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[ledger]\nmin_witnesses = 0\n").expect("write");
        let err = DaemonConfig::load_from(&path).expect_err("zero witnesses");
        assert!(err.to_string().contains("min_witnesses"));

        std::fs::write(&path, "[ledger]\nmin_witnesses = 1\n").expect("write");
        assert_eq!(DaemonConfig::load_from(&path).expect("load").ledger.min_witnesses, 1);
    }

    #[test]
    fn test_explicit_data_dir() {
        let config = DaemonConfig {
            storage: StorageConfig {
                data_dir: "/var/lib/tessera".into(),
            },
            ..DaemonConfig::default()
        };
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/tessera"));
    }
}
