//! Error types for tgmux-core.
//!
//! Each external surface gets its own error enum so callers can distinguish
//! failure modes (tmux missing vs. a dead window, a Telegram 429 vs. a
//! formatting rejection). Everything converges into the crate-level
//! [`Error`] via `#[from]`.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for tgmux operations.
#[derive(Debug, Error)]
pub enum Error {
    /// tmux subprocess failures
    #[error(transparent)]
    Tmux(#[from] TmuxError),

    /// Telegram Bot API failures
    #[error(transparent)]
    Telegram(#[from] TelegramError),

    /// Monitor startup / runtime failures
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Configuration loading / validation failures
    #[error("config: {0}")]
    Config(String),

    /// Filesystem I/O
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (state file, log lines)
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors from driving the tmux CLI.
#[derive(Debug, Error)]
pub enum TmuxError {
    /// The tmux binary is not on PATH.
    #[error("tmux binary not found in PATH")]
    CliNotFound,

    /// The server is not running and the session could not be reached.
    #[error("tmux server not running")]
    NotRunning,

    /// The target window does not exist (killed or never created).
    #[error("window {0} not found")]
    WindowNotFound(String),

    /// A command exited non-zero; carries tmux's stderr.
    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    /// Output from tmux could not be interpreted.
    #[error("unexpected tmux output: {0}")]
    ParseError(String),

    /// Screenshot rendering dependency missing (aha / wkhtmltoimage).
    #[error("screenshot tool unavailable: {0}")]
    ScreenshotUnavailable(String),
}

/// Errors from the Telegram Bot API.
#[derive(Debug, Error)]
pub enum TelegramError {
    /// The API returned `ok: false`.
    #[error("telegram api error {code}: {description}")]
    Api {
        /// HTTP-ish error code from the API response.
        code: i64,
        /// Human-readable description from the API.
        description: String,
        /// Present on 429 responses; seconds to wait.
        retry_after: Option<u64>,
    },

    /// Transport-level failure.
    #[error("telegram http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body did not match the expected shape.
    #[error("telegram response decode error: {0}")]
    Decode(String),
}

impl TelegramError {
    /// Seconds to wait if this is a throttling (429) error, else `None`.
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Api {
                retry_after: Some(secs),
                ..
            } => Some(*secs),
            _ => None,
        }
    }
}

/// Errors raised while starting or running an output monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The backend's log directory does not exist yet.
    #[error("log dir missing: {0}")]
    LogDirMissing(PathBuf),

    /// The filesystem watcher could not be created or attached.
    #[error("watch failed: {0}")]
    Watch(String),
}
