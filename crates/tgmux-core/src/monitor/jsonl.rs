//! Append-log monitor for claude and codex session logs.
//!
//! Watches the backend's log directory with filesystem notifications and
//! reads newline-delimited JSON incrementally, keeping a byte offset per
//! tracked file. Only the principal session file's offset is persisted;
//! subagent logs are tracked in memory.
//!
//! Files that already exist when the monitor starts form a *baseline* and are
//! never adopted: they belong to sessions started outside this process. The
//! exception is the file named by a persisted offset, which is removed from
//! the baseline so the session resumes where it left off.
//!
//! For claude, the first adopted principal file fixes the *session uuid*:
//! principal logs are `<uuid>.jsonl` directly under the root, subagent logs
//! are `<uuid>/subagents/agent-*.jsonl`, and any file whose extracted uuid
//! differs from the locked one is ignored for the lifetime of the monitor.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::backend::{codex_day_dir, BackendKind};
use crate::error::{MonitorError, Result};
use crate::monitor::parse::{parse_codex_value, ClaudeParser};
use crate::monitor::{Monitor, OutputHandler};
use crate::state::{Offset, StateStore};
use crate::topic::TopicKey;

/// Longest accepted log line.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// How often codex monitors look for the new day's directory.
const DAY_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Incremental reader of claude/codex session logs.
pub struct JsonlMonitor {
    topic: TopicKey,
    kind: BackendKind,
    log_dir: PathBuf,
    persisted: Option<Offset>,
    handler: OutputHandler,
    store: StateStore,
    stop_tx: Option<watch::Sender<bool>>,
}

impl JsonlMonitor {
    #[must_use]
    pub fn new(
        topic: TopicKey,
        kind: BackendKind,
        log_dir: PathBuf,
        persisted: Option<Offset>,
        handler: OutputHandler,
        store: StateStore,
    ) -> Self {
        Self {
            topic,
            kind,
            log_dir,
            persisted,
            handler,
            store,
            stop_tx: None,
        }
    }
}

impl Monitor for JsonlMonitor {
    fn start(&mut self) -> Result<()> {
        if !self.log_dir.is_dir() {
            return Err(MonitorError::LogDirMissing(self.log_dir.clone()).into());
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

        let mut watched = HashSet::new();
        watch_dir(&mut watcher, &mut watched, &self.log_dir)?;

        if self.kind == BackendKind::Claude {
            // Subagent logs live two levels down; notify them individually
            // since the root watch is non-recursive.
            scan_and_watch_subdirs(&mut watcher, &mut watched, &self.log_dir);
        }

        if self.kind == BackendKind::Codex {
            let yesterday = Local::now().date_naive().pred_opt();
            if let Some(day) = yesterday {
                let dir = codex_day_dir(day);
                if dir.is_dir() {
                    let _ = watch_dir(&mut watcher, &mut watched, &dir);
                }
            }
        }

        let mut baseline = list_existing_log_files(&self.log_dir, self.kind);
        if self.kind == BackendKind::Codex {
            if let Some(day) = Local::now().date_naive().pred_opt() {
                let dir = codex_day_dir(day);
                if dir.is_dir() {
                    baseline.extend(list_existing_log_files(&dir, self.kind));
                }
            }
        }

        let mut current_file = None;
        let mut file_offsets = HashMap::new();
        let mut session_uuid = None;

        if let Some(offset) = self.persisted.take() {
            let path = PathBuf::from(&offset.file);
            if !offset.file.is_empty() && path.is_file() {
                // Resuming: let WRITE events on the saved file trigger reads.
                baseline.remove(&path);
                file_offsets.insert(path.clone(), offset.byte_offset);
                if self.kind == BackendKind::Claude {
                    session_uuid = principal_uuid(&path, &self.log_dir);
                }
                info!(
                    key = %self.topic,
                    file = %path.display(),
                    offset = offset.byte_offset,
                    "jsonl monitor resuming"
                );
                current_file = Some(path);
            } else if !offset.file.is_empty() {
                warn!(key = %self.topic, file = %offset.file, "saved log file not found, resetting");
            }
        }

        if current_file.is_none() {
            info!(
                key = %self.topic,
                baseline_count = baseline.len(),
                "jsonl monitor waiting for new file"
            );
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let worker = Worker {
            topic: self.topic.clone(),
            kind: self.kind,
            log_dir: self.log_dir.clone(),
            handler: self.handler.clone(),
            store: self.store.clone(),
            watcher,
            watched,
            baseline,
            current_file,
            file_offsets,
            session_uuid,
            claude_parser: ClaudeParser::new(),
            parse_errors: 0,
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
    kind: BackendKind,
    log_dir: PathBuf,
    handler: OutputHandler,
    store: StateStore,
    // Kept alive for the monitor's lifetime; dropping it removes all watches.
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
    baseline: HashSet<PathBuf>,
    /// Principal session log, once adopted.
    current_file: Option<PathBuf>,
    /// Byte offsets per tracked file (principal + subagents).
    file_offsets: HashMap<PathBuf, u64>,
    /// Locked claude session uuid.
    session_uuid: Option<String>,
    claude_parser: ClaudeParser,
    parse_errors: u32,
}

impl Worker {
    async fn run(
        mut self,
        mut event_rx: mpsc::UnboundedReceiver<notify::Event>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut day_check = tokio::time::interval(DAY_CHECK_INTERVAL);
        day_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        day_check.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                event = event_rx.recv() => {
                    let Some(event) = event else { return };
                    self.handle_event(event);
                }
                _ = day_check.tick() => {
                    if self.kind == BackendKind::Codex {
                        self.check_date_change();
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: notify::Event) {
        let created = matches!(event.kind, notify::EventKind::Create(_));
        for path in event.paths {
            if created && path.is_dir() {
                if self.kind == BackendKind::Claude {
                    let _ = watch_dir(&mut self.watcher, &mut self.watched, &path);
                    let subagents = path.join("subagents");
                    if subagents.is_dir() {
                        let _ = watch_dir(&mut self.watcher, &mut self.watched, &subagents);
                    }
                }
                continue;
            }
            self.handle_file_event(&path, created);
        }
    }

    fn handle_file_event(&mut self, path: &Path, created: bool) {
        if !is_log_file(path, self.kind) {
            return;
        }
        if self.baseline.contains(path) {
            return;
        }

        match self.kind {
            BackendKind::Claude => self.handle_claude_file(path),
            _ => self.handle_codex_file(path, created),
        }
    }

    fn handle_claude_file(&mut self, path: &Path) {
        if let Some(uuid) = principal_uuid(path, &self.log_dir) {
            match &self.session_uuid {
                None => {
                    self.session_uuid = Some(uuid);
                    self.adopt_principal(path);
                }
                Some(locked) if *locked == uuid => {
                    if self.current_file.as_deref() == Some(path) {
                        self.read_incremental(path);
                    }
                }
                Some(_) => {
                    debug!(key = %self.topic, file = %path.display(), "ignoring file from another session");
                }
            }
        } else if let Some(uuid) = subagent_uuid(path, &self.log_dir) {
            // Subagent logs are only readable once the session is locked.
            if self.session_uuid.as_deref() == Some(uuid.as_str()) {
                self.read_incremental(path);
            }
        }
    }

    fn handle_codex_file(&mut self, path: &Path, created: bool) {
        if created {
            self.adopt_principal(path);
            return;
        }
        if self.current_file.is_none() {
            self.adopt_principal(path);
            return;
        }
        if self.current_file.as_deref() == Some(path) {
            self.read_incremental(path);
        }
        // Writes to other files never switch the principal; switching only
        // happens through CREATE so another session's log is not misread.
    }

    fn adopt_principal(&mut self, path: &Path) {
        if self.current_file.as_deref() == Some(path) {
            self.read_incremental(path);
            return;
        }
        info!(key = %self.topic, file = %path.display(), "switching jsonl file");
        self.current_file = Some(path.to_path_buf());
        self.file_offsets.insert(path.to_path_buf(), 0);
        self.read_incremental(path);
    }

    fn read_incremental(&mut self, path: &Path) {
        let offset = *self.file_offsets.entry(path.to_path_buf()).or_insert(0);

        let Ok(mut file) = std::fs::File::open(path) else {
            return;
        };
        if offset > 0 && file.seek(SeekFrom::Start(offset)).is_err() {
            return;
        }

        let mut reader = BufReader::with_capacity(256 * 1024, file);
        let mut consumed = offset;
        let mut outputs = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            let n = match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            consumed += n as u64;

            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() || trimmed.len() > MAX_LINE_BYTES {
                continue;
            }
            outputs.extend(self.parse_line(trimmed));
        }

        self.file_offsets.insert(path.to_path_buf(), consumed);
        if self.current_file.as_deref() == Some(path) {
            self.store.set_offset(
                &self.topic,
                Offset {
                    file: path.to_string_lossy().into_owned(),
                    byte_offset: consumed,
                    message_count: 0,
                },
            );
        }

        for content in outputs {
            self.handler.as_ref()(&self.topic, content);
        }
    }

    fn parse_line(&mut self, line: &str) -> Vec<crate::monitor::ParsedContent> {
        let raw: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                self.parse_errors += 1;
                if self.parse_errors % 3 == 0 {
                    warn!(
                        key = %self.topic,
                        errors = self.parse_errors,
                        error = %e,
                        "repeated log line parse failures"
                    );
                }
                return Vec::new();
            }
        };
        self.parse_errors = 0;

        match self.kind {
            BackendKind::Claude => self.claude_parser.parse_value(&raw),
            _ => parse_codex_value(&raw).into_iter().collect(),
        }
    }

    fn check_date_change(&mut self) {
        let today = codex_day_dir(Local::now().date_naive());
        if self.watched.contains(&today) || !today.is_dir() {
            return;
        }
        if watch_dir(&mut self.watcher, &mut self.watched, &today).is_ok() {
            info!(key = %self.topic, dir = %today.display(), "watching new codex day dir");
        }
    }
}

fn watch_dir(
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    dir: &Path,
) -> Result<()> {
    if watched.contains(dir) {
        return Ok(());
    }
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| MonitorError::Watch(format!("{}: {e}", dir.display())))?;
    watched.insert(dir.to_path_buf());
    debug!(dir = %dir.display(), "watching dir");
    Ok(())
}

fn scan_and_watch_subdirs(
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    root: &Path,
) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let _ = watch_dir(watcher, watched, &path);
        let subagents = path.join("subagents");
        if subagents.is_dir() {
            let _ = watch_dir(watcher, watched, &subagents);
        }
    }
}

/// All matching log files under `dir`, recursively.
fn list_existing_log_files(dir: &Path, kind: BackendKind) -> HashSet<PathBuf> {
    let mut files = HashSet::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_log_file(&path, kind) {
                files.insert(path);
            }
        }
    }
    files
}

fn is_log_file(path: &Path, kind: BackendKind) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    match kind {
        BackendKind::Codex => name.starts_with("rollout-") && name.ends_with(".jsonl"),
        _ => name.ends_with(".jsonl"),
    }
}

/// Principal log: `<root>/<uuid>.jsonl` → uuid.
fn principal_uuid(path: &Path, root: &Path) -> Option<String> {
    if path.parent() != Some(root) {
        return None;
    }
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

/// Subagent log: `<root>/<uuid>/subagents/agent-*.jsonl` → uuid.
fn subagent_uuid(path: &Path, root: &Path) -> Option<String> {
    let name = path.file_name().and_then(|n| n.to_str())?;
    if !name.starts_with("agent-") || !name.ends_with(".jsonl") {
        return None;
    }
    let subagents = path.parent()?;
    if subagents.file_name().and_then(|n| n.to_str()) != Some("subagents") {
        return None;
    }
    let uuid_dir = subagents.parent()?;
    if uuid_dir.parent() != Some(root) {
        return None;
    }
    uuid_dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_uuid_extraction() {
        let root = Path::new("/logs");
        assert_eq!(
            principal_uuid(Path::new("/logs/abc-123.jsonl"), root),
            Some("abc-123".to_string())
        );
        // Not directly under the root.
        assert_eq!(principal_uuid(Path::new("/logs/sub/abc.jsonl"), root), None);
        assert_eq!(principal_uuid(Path::new("/logs/abc.txt"), root), None);
    }

    #[test]
    fn subagent_uuid_extraction() {
        let root = Path::new("/logs");
        assert_eq!(
            subagent_uuid(Path::new("/logs/abc-123/subagents/agent-x.jsonl"), root),
            Some("abc-123".to_string())
        );
        assert_eq!(
            subagent_uuid(Path::new("/logs/abc/subagents/other.jsonl"), root),
            None
        );
        assert_eq!(
            subagent_uuid(Path::new("/logs/abc/agents/agent-x.jsonl"), root),
            None
        );
        assert_eq!(
            subagent_uuid(Path::new("/elsewhere/abc/subagents/agent-x.jsonl"), root),
            None
        );
    }

    #[test]
    fn log_file_matching_per_backend() {
        assert!(is_log_file(
            Path::new("/a/session.jsonl"),
            BackendKind::Claude
        ));
        assert!(!is_log_file(Path::new("/a/session.json"), BackendKind::Claude));
        assert!(is_log_file(
            Path::new("/a/rollout-2026-01-01.jsonl"),
            BackendKind::Codex
        ));
        assert!(!is_log_file(
            Path::new("/a/session.jsonl"),
            BackendKind::Codex
        ));
    }

    #[test]
    fn baseline_walk_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("uuid-1").join("subagents");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(dir.path().join("uuid-1.jsonl"), b"{}\n").unwrap();
        std::fs::write(sub.join("agent-a.jsonl"), b"{}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let files = list_existing_log_files(dir.path(), BackendKind::Claude);
        assert_eq!(files.len(), 2);
    }
}
