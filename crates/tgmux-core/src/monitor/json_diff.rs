//! Whole-file diff monitor for gemini.
//!
//! Gemini keeps a single JSON array at `<tmp>/<hash>/logs.json`; the hash
//! directory only appears after the backend launches. The monitor locks onto
//! the first directory created around (or after) the session start time, then
//! reparses the whole array on every write and emits entries whose
//! `messageId` exceeds the high-water mark.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};
use crate::monitor::{Monitor, OutputHandler, ParsedContent};
use crate::state::{Offset, StateStore};
use crate::topic::TopicKey;

/// How long to wait for the hash directory before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack before the session start time when matching directory mtimes.
const START_SLACK: Duration = Duration::from_secs(2);

/// One entry of `logs.json`.
#[derive(Debug, Deserialize)]
struct GeminiLogEntry {
    #[serde(default, rename = "messageId")]
    message_id: i64,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Monitor for gemini's whole-file session log.
pub struct JsonDiffMonitor {
    topic: TopicKey,
    tmp_dir: PathBuf,
    last_message_id: i64,
    start_time: SystemTime,
    handler: OutputHandler,
    store: StateStore,
    stop_tx: Option<watch::Sender<bool>>,
}

impl JsonDiffMonitor {
    #[must_use]
    pub fn new(
        topic: TopicKey,
        tmp_dir: PathBuf,
        last_message_id: i64,
        start_time: SystemTime,
        handler: OutputHandler,
        store: StateStore,
    ) -> Self {
        Self {
            topic,
            tmp_dir,
            last_message_id,
            start_time,
            handler,
            store,
            stop_tx: None,
        }
    }
}

impl Monitor for JsonDiffMonitor {
    fn start(&mut self) -> Result<()> {
        if !self.tmp_dir.is_dir() {
            return Err(MonitorError::LogDirMissing(self.tmp_dir.clone()).into());
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = event_tx.send(event);
                }
            },
        )
        .map_err(|e| MonitorError::Watch(e.to_string()))?;

        let threshold = self.start_time - START_SLACK;
        let locked_dir = scan_existing_dirs(&self.tmp_dir, threshold);

        if let Some(dir) = &locked_dir {
            info!(key = %self.topic, dir = %dir.display(), "locked gemini hash dir");
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| MonitorError::Watch(e.to_string()))?;
        } else {
            watcher
                .watch(&self.tmp_dir, RecursiveMode::NonRecursive)
                .map_err(|e| MonitorError::Watch(e.to_string()))?;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let worker = Worker {
            topic: self.topic.clone(),
            tmp_dir: self.tmp_dir.clone(),
            threshold,
            last_message_id: self.last_message_id,
            handler: self.handler.clone(),
            store: self.store.clone(),
            watcher,
            locked_dir,
        };
        tokio::spawn(worker.run(event_rx, stop_rx));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
    }
}

struct Worker {
    topic: TopicKey,
    tmp_dir: PathBuf,
    threshold: SystemTime,
    last_message_id: i64,
    handler: OutputHandler,
    store: StateStore,
    watcher: RecommendedWatcher,
    locked_dir: Option<PathBuf>,
}

impl Worker {
    async fn run(
        mut self,
        mut event_rx: mpsc::UnboundedReceiver<notify::Event>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        if self.locked_dir.is_some() {
            // Catch up on anything written before the watch was added.
            self.read_and_diff();
        }

        let lock_deadline = tokio::time::Instant::now() + LOCK_TIMEOUT;

        loop {
            if self.locked_dir.is_none() {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    event = event_rx.recv() => {
                        let Some(event) = event else { return };
                        self.handle_unlocked_event(event);
                    }
                    () = tokio::time::sleep_until(lock_deadline) => {
                        warn!(key = %self.topic, "gemini hash dir detection timeout");
                        self.handler.as_ref()(
                            &self.topic,
                            ParsedContent::text(
                                "Could not locate the Gemini log directory; use /screenshot to view terminal output.",
                            ),
                        );
                        return;
                    }
                }
            } else {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    event = event_rx.recv() => {
                        let Some(event) = event else { return };
                        self.handle_locked_event(event);
                    }
                }
            }
        }
    }

    fn handle_unlocked_event(&mut self, event: notify::Event) {
        if !matches!(event.kind, notify::EventKind::Create(_)) {
            return;
        }
        for path in event.paths {
            if !path.is_dir() {
                continue;
            }
            let fresh = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|mtime| mtime >= self.threshold)
                .unwrap_or(false);
            if !fresh {
                continue;
            }

            info!(key = %self.topic, dir = %path.display(), "locked gemini hash dir");
            let _ = self.watcher.unwatch(&self.tmp_dir);
            if let Err(e) = self.watcher.watch(&path, RecursiveMode::NonRecursive) {
                warn!(key = %self.topic, error = %e, "failed to watch gemini hash dir");
                return;
            }
            self.locked_dir = Some(path);
            self.read_and_diff();
            return;
        }
    }

    fn handle_locked_event(&mut self, event: notify::Event) {
        let relevant = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );
        if !relevant {
            return;
        }
        if event
            .paths
            .iter()
            .any(|p| p.file_name().and_then(|n| n.to_str()) == Some("logs.json"))
        {
            self.read_and_diff();
        }
    }

    fn read_and_diff(&mut self) {
        let Some(dir) = &self.locked_dir else { return };
        let logs_path = dir.join("logs.json");
        let Ok(data) = std::fs::read(&logs_path) else {
            return;
        };

        let entries: Vec<GeminiLogEntry> = match serde_json::from_slice(&data) {
            Ok(entries) => entries,
            Err(e) => {
                // The file is rewritten wholesale; a torn read parses on the
                // next write.
                debug!(key = %self.topic, error = %e, "gemini json parse failed, skipping");
                return;
            }
        };

        let mut fresh = Vec::new();
        for entry in entries {
            if entry.kind == "model" && entry.message_id > self.last_message_id {
                self.last_message_id = self.last_message_id.max(entry.message_id);
                if !entry.message.is_empty() {
                    fresh.push(entry.message);
                }
            }
        }

        if fresh.is_empty() {
            return;
        }

        self.store.set_offset(
            &self.topic,
            Offset {
                file: logs_path.to_string_lossy().into_owned(),
                byte_offset: 0,
                message_count: self.last_message_id,
            },
        );
        for message in fresh {
            self.handler.as_ref()(&self.topic, ParsedContent::text(message));
        }
    }
}

/// Most recently modified direct subdirectory with mtime at or after
/// `threshold`.
fn scan_existing_dirs(tmp_dir: &Path, threshold: SystemTime) -> Option<PathBuf> {
    let entries = std::fs::read_dir(tmp_dir).ok()?;
    let mut best: Option<(PathBuf, SystemTime)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if mtime < threshold {
            continue;
        }
        if best.as_ref().is_none_or(|(_, t)| mtime > *t) {
            best = Some((path, mtime));
        }
    }
    best.map(|(path, _)| path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_picks_newest_dir_after_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old");
        let fresh = tmp.path().join("fresh");
        std::fs::create_dir(&old).unwrap();
        std::fs::create_dir(&fresh).unwrap();

        // Everything was just created, so a threshold in the past matches
        // both and picks one of them; a threshold in the future matches none.
        let past = SystemTime::now() - Duration::from_secs(60);
        assert!(scan_existing_dirs(tmp.path(), past).is_some());

        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(scan_existing_dirs(tmp.path(), future), None);
    }

    #[test]
    fn entries_decode_with_defaults() {
        let raw = r#"[
            {"sessionId":"s","messageId":1,"type":"user","message":"hi","timestamp":"t"},
            {"messageId":2,"type":"model","message":"hello"}
        ]"#;
        let entries: Vec<GeminiLogEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, "model");
        assert_eq!(entries[1].message_id, 2);
    }
}
