//! Backend descriptor table.
//!
//! Static metadata for each supported backend: what to launch, how its
//! output is monitored, and where it writes session logs. Config may
//! override the command, arguments and the log directory pattern.

use std::fmt;
use std::path::PathBuf;

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Supported interactive backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Claude Code (Anthropic)
    Claude,
    /// Codex CLI (OpenAI)
    Codex,
    /// Gemini CLI (Google)
    Gemini,
    /// Plain shell
    Bash,
    /// Adopted window with an unidentified program
    Unknown,
}

impl BackendKind {
    /// The kinds a user can pick when creating a session.
    pub const SELECTABLE: [BackendKind; 4] = [
        BackendKind::Claude,
        BackendKind::Codex,
        BackendKind::Gemini,
        BackendKind::Bash,
    ];

    /// Parse a kind from its lowercase name; unknown strings map to
    /// [`BackendKind::Unknown`] so adopted bindings survive round-trips.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "claude" => Self::Claude,
            "codex" => Self::Codex,
            "gemini" => Self::Gemini,
            "bash" => Self::Bash,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Bash => "bash",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a backend's output is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStrategy {
    /// Incremental reads of newline-delimited JSON session logs.
    AppendLog,
    /// Full reparse of a single JSON document with a message-id watermark.
    JsonDiff,
    /// Periodic pane capture + line diff.
    ScreenDiff,
}

/// Resolved launch + monitoring metadata for one backend.
#[derive(Debug, Clone)]
pub struct Backend {
    pub kind: BackendKind,
    /// Launch command; empty means "stay in the spawned shell" (bash).
    pub command: String,
    pub args: Vec<String>,
    /// Directory holding session logs, or `None` for screen-diff backends.
    pub log_dir: Option<LogDirResolver>,
    pub strategy: MonitorStrategy,
}

impl Backend {
    /// Full launch command line, or `None` when nothing should be injected.
    #[must_use]
    pub fn command_line(&self) -> Option<String> {
        if self.command.is_empty() {
            return None;
        }
        if self.args.is_empty() {
            Some(self.command.clone())
        } else {
            Some(format!("{} {}", self.command, self.args.join(" ")))
        }
    }
}

/// Computes the log directory to monitor for a given project path.
#[derive(Debug, Clone)]
pub enum LogDirResolver {
    /// `~/.claude/projects/<project path with '/'→'-'>`
    ClaudeProjects,
    /// `~/.codex/sessions/YYYY/MM/DD` for today
    CodexSessions,
    /// `~/.gemini/tmp` (hash subdirectory located at runtime)
    GeminiTmp,
    /// Config-supplied fixed directory, `~` already expanded.
    Fixed(PathBuf),
}

impl LogDirResolver {
    /// Resolve against `project_path`.
    #[must_use]
    pub fn resolve(&self, project_path: &str) -> PathBuf {
        match self {
            Self::ClaudeProjects => {
                let encoded = project_path.replace('/', "-");
                home_dir().join(".claude").join("projects").join(encoded)
            }
            Self::CodexSessions => codex_day_dir(Local::now().date_naive()),
            Self::GeminiTmp => home_dir().join(".gemini").join("tmp"),
            Self::Fixed(path) => path.clone(),
        }
    }
}

/// `~/.codex/sessions/YYYY/MM/DD` for an arbitrary date (the monitor also
/// watches yesterday and rotates at midnight).
#[must_use]
pub fn codex_day_dir(date: NaiveDate) -> PathBuf {
    home_dir()
        .join(".codex")
        .join("sessions")
        .join(format!("{:04}", date.year()))
        .join(format!("{:02}", date.month()))
        .join(format!("{:02}", date.day()))
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~/` against the home directory.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

/// Default log dir patterns; a config pattern equal to the default keeps the
/// built-in resolver.
const CLAUDE_DEFAULT_PATTERN: &str = "~/.claude/projects/{path_encoded}/";
const CODEX_DEFAULT_PATTERN: &str = "~/.codex/sessions/{date}/";
const GEMINI_DEFAULT_PATTERN: &str = "~/.gemini/tmp/{hash}/";

/// Look up the descriptor for `kind`, applying config overrides.
#[must_use]
pub fn get(kind: BackendKind, cfg: &Config) -> Backend {
    match kind {
        BackendKind::Claude => {
            let bc = &cfg.backends.claude;
            Backend {
                kind,
                command: default_command(&bc.command, "claude"),
                args: bc.args.clone(),
                log_dir: Some(pattern_or(
                    &bc.log_dir_pattern,
                    CLAUDE_DEFAULT_PATTERN,
                    LogDirResolver::ClaudeProjects,
                )),
                strategy: MonitorStrategy::AppendLog,
            }
        }
        BackendKind::Codex => {
            let bc = &cfg.backends.codex;
            Backend {
                kind,
                command: default_command(&bc.command, "codex"),
                args: bc.args.clone(),
                log_dir: Some(pattern_or(
                    &bc.log_dir_pattern,
                    CODEX_DEFAULT_PATTERN,
                    LogDirResolver::CodexSessions,
                )),
                strategy: MonitorStrategy::AppendLog,
            }
        }
        BackendKind::Gemini => {
            let bc = &cfg.backends.gemini;
            Backend {
                kind,
                command: default_command(&bc.command, "gemini"),
                args: bc.args.clone(),
                log_dir: Some(pattern_or(
                    &bc.log_dir_pattern,
                    GEMINI_DEFAULT_PATTERN,
                    LogDirResolver::GeminiTmp,
                )),
                strategy: MonitorStrategy::JsonDiff,
            }
        }
        BackendKind::Bash => {
            let bc = &cfg.backends.bash;
            Backend {
                kind,
                // Empty command: the freshly spawned window already runs a shell.
                command: bc.command.clone(),
                args: bc.args.clone(),
                log_dir: None,
                strategy: MonitorStrategy::ScreenDiff,
            }
        }
        BackendKind::Unknown => Backend {
            kind,
            command: String::new(),
            args: Vec::new(),
            log_dir: None,
            strategy: MonitorStrategy::ScreenDiff,
        },
    }
}

/// Whether `kind` is offered to users, per config.
#[must_use]
pub fn is_enabled(kind: BackendKind, cfg: &Config) -> bool {
    match kind {
        BackendKind::Claude => cfg.backends.claude.is_enabled(),
        BackendKind::Codex => cfg.backends.codex.is_enabled(),
        BackendKind::Gemini => cfg.backends.gemini.is_enabled(),
        BackendKind::Bash => cfg.backends.bash.is_enabled(),
        BackendKind::Unknown => false,
    }
}

fn default_command(configured: &str, default: &str) -> String {
    if configured.is_empty() {
        default.to_string()
    } else {
        configured.to_string()
    }
}

fn pattern_or(configured: &str, default: &str, resolver: LogDirResolver) -> LogDirResolver {
    if configured.is_empty() || configured == default {
        resolver
    } else {
        LogDirResolver::Fixed(expand_home(configured))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_log_dir_encodes_slashes() {
        let dir = LogDirResolver::ClaudeProjects.resolve("/home/me/proj");
        let name = dir.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "-home-me-proj");
        assert!(dir.to_str().unwrap().contains(".claude/projects"));
    }

    #[test]
    fn codex_day_dir_is_zero_padded() {
        let dir = codex_day_dir(NaiveDate::from_ymd_opt(2026, 3, 7).unwrap());
        assert!(dir.ends_with("2026/03/07"));
    }

    #[test]
    fn kind_parse_round_trips() {
        for kind in BackendKind::SELECTABLE {
            assert_eq!(BackendKind::parse(kind.as_str()), kind);
        }
        assert_eq!(BackendKind::parse("something-else"), BackendKind::Unknown);
    }

    #[test]
    fn config_overrides_command_and_pattern() {
        let mut cfg = Config::default();
        cfg.backends.claude.command = "claude-dev".into();
        cfg.backends.claude.log_dir_pattern = "/var/log/claude".into();
        let be = get(BackendKind::Claude, &cfg);
        assert_eq!(be.command, "claude-dev");
        match be.log_dir.unwrap() {
            LogDirResolver::Fixed(p) => assert_eq!(p, PathBuf::from("/var/log/claude")),
            other => panic!("expected fixed resolver, got {other:?}"),
        }
    }

    #[test]
    fn default_pattern_keeps_builtin_resolver() {
        let mut cfg = Config::default();
        cfg.backends.claude.log_dir_pattern = "~/.claude/projects/{path_encoded}/".into();
        let be = get(BackendKind::Claude, &cfg);
        assert!(matches!(
            be.log_dir.unwrap(),
            LogDirResolver::ClaudeProjects
        ));
    }

    #[test]
    fn bash_has_no_log_dir() {
        let cfg = Config::default();
        let be = get(BackendKind::Bash, &cfg);
        assert!(be.log_dir.is_none());
        assert_eq!(be.strategy, MonitorStrategy::ScreenDiff);
        assert!(be.command_line().is_none());
    }

    #[test]
    fn command_line_joins_args() {
        let mut cfg = Config::default();
        cfg.backends.codex.args = vec!["--full-auto".into()];
        let be = get(BackendKind::Codex, &cfg);
        assert_eq!(be.command_line().unwrap(), "codex --full-auto");
    }
}
