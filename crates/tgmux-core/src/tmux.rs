//! tmux CLI client wrapper.
//!
//! Provides a type-safe interface to the tmux commands the bridge needs. All
//! managed windows live in one fixed session (`tgmux`). The operations are
//! exposed through the [`Multiplexer`] trait so monitors, serializers and the
//! controller can run against a mock in tests.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Result, TmuxError};

/// Name of the tmux session holding all managed windows.
pub const SESSION_NAME: &str = "tgmux";

/// Shells that indicate the backend process has exited back to a prompt.
const SHELL_COMMANDS: [&str; 8] = ["bash", "zsh", "sh", "fish", "dash", "ksh", "csh", "tcsh"];

/// Boxed future for multiplexer operations.
pub type MuxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Shared handle to a multiplexer implementation.
pub type MuxHandle = std::sync::Arc<dyn Multiplexer>;

/// A window in the managed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    /// Window id, e.g. `@0`.
    pub id: String,
    /// Window name, e.g. `claude-my-project`.
    pub name: String,
}

/// Abstraction over tmux interactions.
pub trait Multiplexer: Send + Sync {
    /// Idempotently create the managed session.
    fn ensure_session(&self) -> MuxFuture<'_, ()>;
    /// Spawn a new window; returns its window id.
    fn new_window<'a>(&'a self, name: &'a str) -> MuxFuture<'a, String>;
    /// Kill a window.
    fn kill_window<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, ()>;
    /// Send literal single-line text (no key-name interpretation, no Enter).
    fn send_keys<'a>(&'a self, window_id: &'a str, text: &'a str) -> MuxFuture<'a, ()>;
    /// Send the Enter key.
    fn send_enter<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, ()>;
    /// Send the Escape key.
    fn send_escape<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, ()>;
    /// Send a named key (`Up`, `Down`, `Left`, `Right`, `Enter`, `Escape`,
    /// `Tab`, `Space`, `C-c`).
    fn send_special_key<'a>(&'a self, window_id: &'a str, key_name: &'a str) -> MuxFuture<'a, ()>;
    /// Send text, routing multi-line input through a paste buffer, and append
    /// Enter.
    fn send_text<'a>(&'a self, window_id: &'a str, text: &'a str) -> MuxFuture<'a, ()>;
    /// Pane scrollback with escape sequences preserved.
    fn capture_pane_raw<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, String>;
    /// Pane scrollback stripped of ANSI sequences.
    fn capture_pane_clean<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, String>;
    /// All windows in the managed session.
    fn list_windows(&self) -> MuxFuture<'_, Vec<WindowInfo>>;
    /// Whether the window still exists.
    fn is_window_alive<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, bool>;
    /// Process name currently running in the window's pane.
    fn pane_command<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, String>;
    /// Whether a backend (not a bare shell) is running in the window.
    fn is_backend_alive<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, bool>;
    /// Render the pane as a PNG (requires `aha` and `wkhtmltoimage`).
    fn render_screenshot<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, Vec<u8>>;
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]|\x1b\].*?\x07|\x1b\[.*?m").expect("ansi regex")
    })
}

/// Strip ANSI escape sequences.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    ansi_re().replace_all(text, "").into_owned()
}

/// tmux CLI client bound to the managed session.
#[derive(Debug, Clone, Default)]
pub struct TmuxClient {}

impl TmuxClient {
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }

    fn target(window_id: &str) -> String {
        format!("{SESSION_NAME}:{window_id}")
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TmuxError::CliNotFound,
                _ => TmuxError::CommandFailed(e.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("no server running") || stderr.contains("error connecting") {
                return Err(TmuxError::NotRunning.into());
            }
            return Err(TmuxError::CommandFailed(stderr).into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ensure_session_impl(&self) -> Result<()> {
        if self
            .run(&["has-session", "-t", SESSION_NAME])
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.run(&["new-session", "-d", "-s", SESSION_NAME]).await?;
        Ok(())
    }

    async fn send_text_impl(&self, window_id: &str, text: &str) -> Result<()> {
        if needs_paste_buffer(text) {
            self.load_and_paste(window_id, text).await?;
        } else {
            let target = Self::target(window_id);
            self.run(&["send-keys", "-t", &target, "-l", text]).await?;
        }
        let target = Self::target(window_id);
        self.run(&["send-keys", "-t", &target, "Enter"]).await?;
        Ok(())
    }

    /// Multi-line input: load the text into a tmux buffer over stdin, then
    /// paste it into the target window. `send-keys -l` would mangle embedded
    /// newlines.
    async fn load_and_paste(&self, window_id: &str, text: &str) -> Result<()> {
        let mut child = Command::new("tmux")
            .args(["load-buffer", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TmuxError::CliNotFound,
                _ => TmuxError::CommandFailed(e.to_string()),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| TmuxError::CommandFailed(format!("load-buffer stdin: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TmuxError::CommandFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(TmuxError::CommandFailed(format!(
                "load-buffer: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }

        let target = Self::target(window_id);
        self.run(&["paste-buffer", "-t", &target]).await?;
        Ok(())
    }

    async fn list_windows_impl(&self) -> Result<Vec<WindowInfo>> {
        let out = self
            .run(&[
                "list-windows",
                "-t",
                SESSION_NAME,
                "-F",
                "#{window_id}\t#{window_name}",
            ])
            .await?;
        Ok(parse_window_list(&out))
    }

    async fn render_screenshot_impl(&self, window_id: &str) -> Result<Vec<u8>> {
        for tool in ["aha", "wkhtmltoimage"] {
            if which(tool).await.is_none() {
                return Err(TmuxError::ScreenshotUnavailable(format!("{tool} not installed")).into());
            }
        }

        let raw = self.capture_pane_raw_impl(window_id).await?;
        let html = pipe_through("aha", &["--no-header"], raw.as_bytes()).await?;
        let full_html = format!(
            "<!DOCTYPE html><html><head><style>body{{background:#1e1e1e;color:#d4d4d4;\
             font-family:monospace;font-size:14px;padding:16px;white-space:pre;}}</style>\
             </head><body>{}</body></html>",
            String::from_utf8_lossy(&html)
        );
        let png = pipe_through(
            "wkhtmltoimage",
            &["--quality", "90", "--width", "800", "-", "-"],
            full_html.as_bytes(),
        )
        .await?;
        Ok(png)
    }

    async fn capture_pane_raw_impl(&self, window_id: &str) -> Result<String> {
        let target = Self::target(window_id);
        self.run(&["capture-pane", "-t", &target, "-p", "-e"]).await
    }
}

fn parse_window_list(out: &str) -> Vec<WindowInfo> {
    out.lines()
        .filter_map(|line| {
            let (id, name) = line.split_once('\t')?;
            if id.is_empty() {
                return None;
            }
            Some(WindowInfo {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

async fn which(tool: &str) -> Option<()> {
    let status = Command::new("which")
        .arg(tool)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .ok()?;
    status.success().then_some(())
}

async fn pipe_through(cmd: &str, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| TmuxError::ScreenshotUnavailable(format!("{cmd}: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .await
            .map_err(|e| TmuxError::ScreenshotUnavailable(format!("{cmd} stdin: {e}")))?;
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| TmuxError::ScreenshotUnavailable(format!("{cmd}: {e}")))?;
    if !output.status.success() {
        return Err(TmuxError::ScreenshotUnavailable(format!("{cmd} exited non-zero")).into());
    }
    Ok(output.stdout)
}

impl Multiplexer for TmuxClient {
    fn ensure_session(&self) -> MuxFuture<'_, ()> {
        Box::pin(self.ensure_session_impl())
    }

    fn new_window<'a>(&'a self, name: &'a str) -> MuxFuture<'a, String> {
        Box::pin(async move {
            // The session may have been destroyed since startup.
            self.ensure_session_impl().await?;
            let out = self
                .run(&[
                    "new-window",
                    "-t",
                    SESSION_NAME,
                    "-n",
                    name,
                    "-P",
                    "-F",
                    "#{window_id}",
                ])
                .await?;
            let id = out.trim().to_string();
            if id.is_empty() {
                return Err(TmuxError::ParseError("empty window id from new-window".into()).into());
            }
            Ok(id)
        })
    }

    fn kill_window<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(async move {
            let target = Self::target(window_id);
            self.run(&["kill-window", "-t", &target]).await?;
            Ok(())
        })
    }

    fn send_keys<'a>(&'a self, window_id: &'a str, text: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(async move {
            let target = Self::target(window_id);
            self.run(&["send-keys", "-t", &target, "-l", text]).await?;
            Ok(())
        })
    }

    fn send_enter<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, ()> {
        self.send_special_key(window_id, "Enter")
    }

    fn send_escape<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, ()> {
        self.send_special_key(window_id, "Escape")
    }

    fn send_special_key<'a>(&'a self, window_id: &'a str, key_name: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(async move {
            let target = Self::target(window_id);
            self.run(&["send-keys", "-t", &target, key_name]).await?;
            Ok(())
        })
    }

    fn send_text<'a>(&'a self, window_id: &'a str, text: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(self.send_text_impl(window_id, text))
    }

    fn capture_pane_raw<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, String> {
        Box::pin(self.capture_pane_raw_impl(window_id))
    }

    fn capture_pane_clean<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, String> {
        Box::pin(async move {
            let raw = self.capture_pane_raw_impl(window_id).await?;
            Ok(strip_ansi(&raw))
        })
    }

    fn list_windows(&self) -> MuxFuture<'_, Vec<WindowInfo>> {
        Box::pin(self.list_windows_impl())
    }

    fn is_window_alive<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, bool> {
        Box::pin(async move {
            let out = self
                .run(&["list-windows", "-t", SESSION_NAME, "-F", "#{window_id}"])
                .await
                .unwrap_or_default();
            Ok(out.lines().any(|line| line.trim() == window_id))
        })
    }

    fn pane_command<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, String> {
        Box::pin(async move {
            let target = Self::target(window_id);
            let out = self
                .run(&[
                    "display-message",
                    "-t",
                    &target,
                    "-p",
                    "#{pane_current_command}",
                ])
                .await
                .unwrap_or_default();
            Ok(out.trim().to_string())
        })
    }

    fn is_backend_alive<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, bool> {
        Box::pin(async move {
            let proc = self.pane_command(window_id).await?;
            Ok(backend_process_alive(&proc))
        })
    }

    fn render_screenshot<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, Vec<u8>> {
        Box::pin(self.render_screenshot_impl(window_id))
    }
}

/// A pane command counts as a live backend when it is non-empty and not a
/// bare shell.
#[must_use]
pub fn backend_process_alive(pane_command: &str) -> bool {
    !pane_command.is_empty() && !SHELL_COMMANDS.contains(&pane_command)
}

/// Multi-line input must go through `load-buffer` + `paste-buffer`;
/// `send-keys -l` would mangle embedded newlines.
#[must_use]
pub fn needs_paste_buffer(text: &str) -> bool {
    text.contains('\n')
}
