//! Daemon runtime configuration.
//!
//! Loaded from `~/.playtime/daemon.toml` (or `PLAYTIME_CONFIG`). A missing file
//! yields defaults; every section and field is optional.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const HOME_ENV: &str = "PLAYTIME_HOME";
const CONFIG_ENV: &str = "PLAYTIME_CONFIG";
const BIND_ENV: &str = "PLAYTIME_BIND";
const MAX_EXPIRED_GRACE_SECS: i64 = 7 * 24 * 60 * 60;
const HOME_DIR_NAME: &str = ".playtime";
const CONFIG_FILE_NAME: &str = "daemon.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub ping_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7878".to_string(),
            ping_interval_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub interval_secs: u64,
    /// How long an expired timer stays readable before it is pruned.
    pub expired_grace_secs: i64,
    pub extension_tier_policy: ExtensionTierPolicy,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            expired_grace_secs: 10 * 60,
            extension_tier_policy: ExtensionTierPolicy::Keep,
        }
    }
}

impl EvaluatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn expired_grace(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.expired_grace_secs.clamp(0, MAX_EXPIRED_GRACE_SECS))
            .unwrap_or_else(chrono::Duration::zero)
    }
}

/// What an extension does to the tiers a timer has already crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionTierPolicy {
    /// `last_alert_tier` is untouched; crossed tiers never fire again.
    #[default]
    Keep,
    /// `last_alert_tier` is recomputed from the new remaining time, so tiers
    /// now ahead of the timer fire again when crossed.
    Reset,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub send_timeout_ms: u64,
    pub channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 3_000,
            channel_capacity: 64,
        }
    }
}

impl BroadcastConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// When set, logs are also written to a daily-rolling file in this directory.
    pub dir: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=60).contains(&self.evaluator.interval_secs) {
            return Err(invalid(
                "evaluator.interval_secs",
                "must be between 1 and 60",
            ));
        }
        if !(0..=MAX_EXPIRED_GRACE_SECS).contains(&self.evaluator.expired_grace_secs) {
            return Err(invalid(
                "evaluator.expired_grace_secs",
                "must be between 0 and 604800 (7 days)",
            ));
        }
        if !(2_000..=5_000).contains(&self.broadcast.send_timeout_ms) {
            return Err(invalid(
                "broadcast.send_timeout_ms",
                "must be between 2000 and 5000",
            ));
        }
        if self.broadcast.channel_capacity == 0 {
            return Err(invalid("broadcast.channel_capacity", "must be positive"));
        }
        if self.server.bind.trim().is_empty() {
            return Err(invalid("server.bind", "must not be empty"));
        }
        Ok(())
    }

    fn override_bind(&mut self, bind: Option<&str>) {
        if let Some(bind) = bind.filter(|bind| !bind.trim().is_empty()) {
            self.server.bind = bind.to_string();
        }
    }
}

fn invalid(field: &str, details: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        details: details.to_string(),
    }
}

/// Loads and validates the config. On any error the defaults are used instead,
/// still honouring `PLAYTIME_BIND`, and the error is handed back for logging.
pub fn load_config(path: Option<PathBuf>) -> (DaemonConfig, Option<ConfigError>) {
    let bind_override = env::var(BIND_ENV).ok();
    resolve_config(path, bind_override.as_deref())
}

fn resolve_config(
    path: Option<PathBuf>,
    bind_override: Option<&str>,
) -> (DaemonConfig, Option<ConfigError>) {
    match read_validated(path, bind_override) {
        Ok(config) => (config, None),
        Err(err) => {
            let mut config = DaemonConfig::default();
            config.override_bind(bind_override);
            (config, Some(err))
        }
    }
}

fn read_validated(
    path: Option<PathBuf>,
    bind_override: Option<&str>,
) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    let mut config = read_config_file(&config_path)?;
    config.override_bind(bind_override);
    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<DaemonConfig, ConfigError> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn playtime_home() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(HOME_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    Ok(home.join(HOME_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(playtime_home()?.join(CONFIG_FILE_NAME))
}

pub fn store_path() -> Result<PathBuf, ConfigError> {
    Ok(playtime_home()?.join("daemon").join("timers.db"))
}

pub fn crash_ledger_path() -> Result<PathBuf, ConfigError> {
    Ok(playtime_home()?.join("daemon").join("crash-ledger.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = read_config_file(&temp_dir.path().join("missing.toml")).expect("load");
        assert_eq!(config.evaluator.interval_secs, 5);
        assert_eq!(config.evaluator.expired_grace_secs, 600);
        assert_eq!(config.evaluator.extension_tier_policy, ExtensionTierPolicy::Keep);
        assert_eq!(config.broadcast.send_timeout_ms, 3_000);
        assert!(config.logging.dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("daemon.toml");
        fs_err::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:9000"

[evaluator]
interval_secs = 10
expired_grace_secs = 120
extension_tier_policy = "reset"

[broadcast]
send_timeout_ms = 2000

[logging]
dir = "/var/log/playtime"
"#,
        )
        .expect("write config");

        let config = read_config_file(&path).expect("load config");
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.ping_interval_secs, 20);
        assert_eq!(config.evaluator.interval(), Duration::from_secs(10));
        assert_eq!(config.evaluator.expired_grace(), chrono::Duration::seconds(120));
        assert_eq!(config.evaluator.extension_tier_policy, ExtensionTierPolicy::Reset);
        assert_eq!(config.broadcast.send_timeout(), Duration::from_millis(2000));
        assert_eq!(config.broadcast.channel_capacity, 64);
        assert_eq!(
            config.logging.dir.as_deref(),
            Some(Path::new("/var/log/playtime"))
        );
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("daemon.toml");
        fs_err::write(&path, "[evaluator]\ninterval_secs = \"soon\"\n").expect("write config");

        let err = read_config_file(&path).expect_err("should fail");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = DaemonConfig::default();
        config.evaluator.interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "evaluator.interval_secs"
        ));
    }

    #[test]
    fn grace_is_bounded_and_never_panics() {
        let mut config = DaemonConfig::default();
        config.evaluator.expired_grace_secs = 10_000_000_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "evaluator.expired_grace_secs"
        ));
        assert_eq!(config.evaluator.expired_grace(), chrono::Duration::days(7));

        config.evaluator.expired_grace_secs = i64::MAX;
        assert_eq!(config.evaluator.expired_grace(), chrono::Duration::days(7));
        config.evaluator.expired_grace_secs = i64::MIN;
        assert_eq!(config.evaluator.expired_grace(), chrono::Duration::zero());

        config.evaluator.expired_grace_secs = MAX_EXPIRED_GRACE_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_file_falls_back_to_defaults_with_bind_override() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("daemon.toml");
        fs_err::write(&path, "[broadcast]\nsend_timeout_ms = 1000\n").expect("write config");

        let (config, err) = resolve_config(Some(path.clone()), Some("127.0.0.1:9911"));
        assert!(matches!(err, Some(ConfigError::Invalid { .. })));
        assert_eq!(config.server.bind, "127.0.0.1:9911");
        assert_eq!(config.broadcast.send_timeout_ms, 3_000);

        let (config, _) = resolve_config(Some(path), None);
        assert_eq!(config.server.bind, "127.0.0.1:7878");
    }

    #[test]
    fn bind_override_applies_to_valid_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("daemon.toml");
        fs_err::write(&path, "[server]\nbind = \"0.0.0.0:9000\"\n").expect("write config");

        let (config, err) = resolve_config(Some(path.clone()), Some("127.0.0.1:9912"));
        assert!(err.is_none());
        assert_eq!(config.server.bind, "127.0.0.1:9912");

        let (config, _) = resolve_config(Some(path), Some("  "));
        assert_eq!(config.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn send_timeout_must_stay_within_two_to_five_seconds() {
        let mut config = DaemonConfig::default();
        config.broadcast.send_timeout_ms = 500;
        assert!(config.validate().is_err());
        config.broadcast.send_timeout_ms = 5_000;
        assert!(config.validate().is_ok());
        config.broadcast.send_timeout_ms = 10_000;
        assert!(config.validate().is_err());
    }
}
