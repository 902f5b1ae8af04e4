//! Output monitors.
//!
//! One monitor runs per bound topic and extracts backend output as
//! [`ParsedContent`] blocks, delivered through an injected handler:
//!
//! - [`jsonl::JsonlMonitor`] — incremental append-only log reads (claude, codex)
//! - [`json_diff::JsonDiffMonitor`] — whole-file JSON reparse (gemini)
//! - [`pane::PaneMonitor`] — periodic pane capture + line diff (bash, fallback)
//!
//! The [`Dispatcher`] owns the topic→monitor map, enforces one monitor per
//! topic, and falls back from log-based monitors to the screen-diff monitor
//! when startup fails.

pub mod json_diff;
pub mod jsonl;
pub mod pane;
pub mod parse;
pub mod prompts;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{info, warn};

use crate::backend::{self, MonitorStrategy};
use crate::config::Config;
use crate::error::Result;
use crate::state::{Binding, StateStore};
use crate::tmux::MuxHandle;
use crate::topic::TopicKey;

/// Kind of an output block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Plain text / final answer
    Text,
    /// Reasoning trace
    Thinking,
    /// Tool invocation summary
    ToolUse,
    /// Tool result summary
    ToolResult,
}

/// A tagged unit of backend output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedContent {
    pub kind: ContentKind,
    pub text: String,
    /// Correlation key pairing a tool use with its later result.
    pub tool_use_id: Option<String>,
    /// Backend-reported tool identifier.
    pub tool_name: Option<String>,
}

impl ParsedContent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: text.into(),
            tool_use_id: None,
            tool_name: None,
        }
    }

    #[must_use]
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Thinking,
            text: text.into(),
            tool_use_id: None,
            tool_name: None,
        }
    }
}

/// Callback receiving output blocks for a topic.
pub type OutputHandler = Arc<dyn Fn(&TopicKey, ParsedContent) + Send + Sync>;

/// A running output monitor.
///
/// `start` is non-blocking: it validates preconditions, spawns a single
/// worker task and returns. `stop` cancels the worker; in-flight work
/// observes the cancellation at its next suspension point.
pub trait Monitor: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
}

/// Starts and tracks monitors, one per topic.
pub struct Dispatcher {
    cfg: Config,
    store: StateStore,
    mux: MuxHandle,
    monitors: Mutex<HashMap<TopicKey, Box<dyn Monitor>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(cfg: Config, store: StateStore, mux: MuxHandle) -> Self {
        Self {
            cfg,
            store,
            mux,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Start the right monitor for `binding`, replacing any monitor already
    /// registered for `key`. Log-based monitors that fail to start fall back
    /// to the screen-diff monitor.
    pub fn start_monitor(
        &self,
        key: &TopicKey,
        binding: &Binding,
        handler: OutputHandler,
    ) -> Result<()> {
        let mut monitors = self.lock();

        if let Some(mut existing) = monitors.remove(key) {
            existing.stop();
        }

        let be = backend::get(binding.backend, &self.cfg);
        let mut mon: Box<dyn Monitor> = match (be.strategy, &be.log_dir) {
            (MonitorStrategy::AppendLog, Some(resolver)) => {
                let log_dir = resolver.resolve(&binding.project_path);
                let offset = self.store.get_offset(key);
                Box::new(jsonl::JsonlMonitor::new(
                    key.clone(),
                    binding.backend,
                    log_dir,
                    offset,
                    handler.clone(),
                    self.store.clone(),
                ))
            }
            (MonitorStrategy::JsonDiff, Some(resolver)) => {
                let tmp_dir = resolver.resolve(&binding.project_path);
                let last_message_id = self
                    .store
                    .get_offset(key)
                    .map_or(0, |o| o.message_count);
                Box::new(json_diff::JsonDiffMonitor::new(
                    key.clone(),
                    tmp_dir,
                    last_message_id,
                    SystemTime::now(),
                    handler.clone(),
                    self.store.clone(),
                ))
            }
            _ => self.pane_monitor(key, binding, handler.clone()),
        };

        if let Err(e) = mon.start() {
            if be.strategy == MonitorStrategy::ScreenDiff {
                return Err(e);
            }
            warn!(key = %key, error = %e, "log monitor failed, falling back to capture-pane");
            mon = self.pane_monitor(key, binding, handler);
            mon.start()?;
        }

        monitors.insert(key.clone(), mon);
        info!(key = %key, backend = %binding.backend, "monitor started");
        Ok(())
    }

    /// Stop and forget the monitor for `key`, if any.
    pub fn stop_monitor(&self, key: &TopicKey) {
        if let Some(mut mon) = self.lock().remove(key) {
            mon.stop();
            info!(key = %key, "monitor stopped");
        }
    }

    /// Stop every monitor. Idempotent.
    pub fn stop_all(&self) {
        let mut monitors = self.lock();
        for (key, mon) in monitors.iter_mut() {
            mon.stop();
            info!(key = %key, "monitor stopped");
        }
        monitors.clear();
    }

    /// Whether a monitor is registered for `key`.
    #[must_use]
    pub fn is_monitoring(&self, key: &TopicKey) -> bool {
        self.lock().contains_key(key)
    }

    fn pane_monitor(
        &self,
        key: &TopicKey,
        binding: &Binding,
        handler: OutputHandler,
    ) -> Box<dyn Monitor> {
        Box::new(pane::PaneMonitor::new(
            key.clone(),
            binding.window_id.clone(),
            Arc::clone(&self.mux),
            self.cfg.monitor.poll_interval(),
            handler,
        ))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TopicKey, Box<dyn Monitor>>> {
        self.monitors.lock().unwrap_or_else(|p| p.into_inner())
    }
}
