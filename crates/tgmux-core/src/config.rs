//! Configuration loading.
//!
//! Configuration is read from `~/.tgmux/config.yaml`. Every section has
//! working defaults; only `telegram.token` and `telegram.allowed_users` are
//! required. The bot token may also come from the `TGMUX_BOT_TOKEN`
//! environment variable, which takes precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Environment variable overriding `telegram.token`.
pub const TOKEN_ENV: &str = "TGMUX_BOT_TOKEN";

/// Telegram credentials and access control.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token (required unless `TGMUX_BOT_TOKEN` is set).
    pub token: String,
    /// User ids allowed to talk to the bot. Messages from anyone else are
    /// silently dropped.
    pub allowed_users: Vec<i64>,
}

/// Per-backend launch overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Launch command; empty means the backend's default.
    pub command: String,
    /// Extra arguments appended to the command.
    pub args: Vec<String>,
    /// Overrides the default log directory resolver when set to a
    /// non-default pattern. `~` is expanded.
    pub log_dir_pattern: String,
    /// Defaults to true when absent.
    pub enabled: Option<bool>,
}

impl BackendConfig {
    /// Whether this backend is offered to users.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// All four backend sections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub claude: BackendConfig,
    pub codex: BackendConfig,
    pub gemini: BackendConfig,
    pub bash: BackendConfig,
}

/// Directory bookmark settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirsConfig {
    /// Pre-seeded favorite project directories.
    pub favorites: Vec<String>,
    /// Cap on the auto-maintained recent list.
    pub recent_max: usize,
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            favorites: Vec::new(),
            recent_max: 10,
        }
    }
}

/// Security toggles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Redact secret-looking substrings before sending to Telegram.
    pub redact_secrets: bool,
    /// Warn when the config file is not mode 0600.
    pub config_permission_check: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            redact_secrets: true,
            config_permission_check: true,
        }
    }
}

/// Monitor timing knobs. Durations are given in seconds in the YAML file
/// (fractions allowed).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Screen-diff capture interval in seconds.
    pub poll_interval: f64,
    /// Status poller interval in seconds; `<= 0` disables the poller.
    pub status_poll_interval: f64,
    /// Legacy throttle, parsed but unused by the queue-based pusher.
    pub group_throttle: f64,
    /// Legacy throttle, parsed but unused by the queue-based pusher.
    pub private_throttle: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: 0.5,
            status_poll_interval: 0.0,
            group_throttle: 3.0,
            private_throttle: 1.0,
        }
    }
}

impl MonitorConfig {
    /// Screen-diff polling interval, floored at 100 ms.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval.max(0.1))
    }

    /// Status poller interval; `None` disables the poller.
    #[must_use]
    pub fn status_poll_interval(&self) -> Option<Duration> {
        if self.status_poll_interval > 0.0 {
            Some(Duration::from_secs_f64(self.status_poll_interval))
        } else {
            None
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub backends: BackendsConfig,
    pub dirs: DirsConfig,
    pub security: SecurityConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load and validate configuration from `path`.
    ///
    /// `TGMUX_BOT_TOKEN` overrides `telegram.token`. Missing token or an
    /// empty allow-list is a fatal startup error.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let mut cfg: Config = serde_yaml::from_str(&data)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                cfg.telegram.token = token;
            }
        }

        if cfg.telegram.token.is_empty() {
            return Err(Error::Config(format!(
                "telegram.token is required (set in config or {TOKEN_ENV} env)"
            )));
        }
        if cfg.telegram.allowed_users.is_empty() {
            return Err(Error::Config(
                "telegram.allowed_users must not be empty".into(),
            ));
        }

        Ok(cfg)
    }

    /// Default config file location: `~/.tgmux/config.yaml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        data_dir().join("config.yaml")
    }

    /// Default state file location: `~/.tgmux/state.json`.
    #[must_use]
    pub fn default_state_path() -> PathBuf {
        data_dir().join("state.json")
    }
}

/// `~/.tgmux`, falling back to the current directory when no home exists.
fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tgmux")
}

/// Warn when the config file permissions are wider than 0600.
pub fn check_file_permission(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode != 0o600 {
                warn!(
                    path = %path.display(),
                    current_perm = format!("{mode:o}"),
                    "config file permission is not 600, consider restricting access"
                );
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
