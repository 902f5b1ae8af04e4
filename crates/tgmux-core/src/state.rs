//! Durable topic state.
//!
//! Three maps live behind one lock: topic→binding, topic→read-offset, and
//! directory bookmarks. Every mutation schedules a debounced flush (writes
//! within 500 ms coalesce into one) handled by a background persister task;
//! [`StateStore::close`] performs a final synchronous flush.
//!
//! The file is a single JSON document written via temp-file + rename so a
//! crash mid-write never truncates existing state, with mode 0600.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{error, warn};

use crate::backend::BackendKind;
use crate::error::Result;
use crate::topic::TopicKey;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Whether a bound window is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingStatus {
    Running,
    Disconnected,
}

/// The association of a topic with one tmux window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    /// Opaque tmux window handle, e.g. `@7`.
    pub window_id: String,
    pub backend: BackendKind,
    /// Directory the backend was started in; empty for adopted windows.
    #[serde(default)]
    pub project_path: String,
    /// Human label, `<backend> @ <dirname>`.
    #[serde(default)]
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub status: BindingStatus,
}

/// Read progress for a log-monitored topic. Only one of `byte_offset` /
/// `message_count` is meaningful for a given backend kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Offset {
    /// Absolute path of the principal session log.
    #[serde(default)]
    pub file: String,
    /// Bytes already consumed from `file` (append-log monitors).
    #[serde(default)]
    pub byte_offset: u64,
    /// Highest message id already surfaced (whole-file diff monitors).
    #[serde(default)]
    pub message_count: i64,
}

/// Directory bookmarks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirState {
    /// User-managed, ordered, duplicate-free.
    #[serde(default)]
    pub favorites: Vec<String>,
    /// Most-recent-first, duplicate-free, capped.
    #[serde(default)]
    pub recent: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateData {
    #[serde(default)]
    bindings: HashMap<TopicKey, Binding>,
    #[serde(default)]
    offsets: HashMap<TopicKey, Offset>,
    #[serde(default)]
    dirs: DirState,
}

struct Inner {
    data: RwLock<StateData>,
    path: PathBuf,
    recent_max: usize,
    save_tx: mpsc::Sender<()>,
    done_tx: watch::Sender<bool>,
}

/// Durable store for bindings, offsets and bookmarks. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl StateStore {
    /// Open (or initialize) the store at `path` and start the persister.
    ///
    /// A missing or unparseable file logs a warning and starts empty.
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn open(path: PathBuf, recent_max: usize) -> Self {
        let data = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<StateData>(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse state file, starting fresh");
                    StateData::default()
                }
            },
            Err(_) => StateData::default(),
        };

        let (save_tx, save_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            data: RwLock::new(data),
            path,
            recent_max: recent_max.max(1),
            save_tx,
            done_tx,
        });

        tokio::spawn(persist_loop(Arc::clone(&inner), save_rx, done_rx));

        Self { inner }
    }

    fn trigger_save(&self) {
        // A full channel means a flush is already pending; coalesce.
        let _ = self.inner.save_tx.try_send(());
    }

    // ─── Bindings ───────────────────────────────────────────────────

    pub fn set_binding(&self, key: &TopicKey, binding: Binding) {
        self.write().bindings.insert(key.clone(), binding);
        self.trigger_save();
    }

    #[must_use]
    pub fn get_binding(&self, key: &TopicKey) -> Option<Binding> {
        self.read().bindings.get(key).cloned()
    }

    pub fn delete_binding(&self, key: &TopicKey) {
        self.write().bindings.remove(key);
        self.trigger_save();
    }

    /// Snapshot copy, safe to iterate without holding the lock.
    #[must_use]
    pub fn all_bindings(&self) -> HashMap<TopicKey, Binding> {
        self.read().bindings.clone()
    }

    // ─── Offsets ────────────────────────────────────────────────────

    pub fn set_offset(&self, key: &TopicKey, offset: Offset) {
        self.write().offsets.insert(key.clone(), offset);
        self.trigger_save();
    }

    #[must_use]
    pub fn get_offset(&self, key: &TopicKey) -> Option<Offset> {
        self.read().offsets.get(key).cloned()
    }

    pub fn delete_offset(&self, key: &TopicKey) {
        self.write().offsets.remove(key);
        self.trigger_save();
    }

    // ─── Directories ────────────────────────────────────────────────

    pub fn add_favorite(&self, path: &str) {
        {
            let mut data = self.write();
            if data.dirs.favorites.iter().any(|f| f == path) {
                return;
            }
            data.dirs.favorites.push(path.to_string());
        }
        self.trigger_save();
    }

    pub fn remove_favorite(&self, path: &str) {
        self.write().dirs.favorites.retain(|f| f != path);
        self.trigger_save();
    }

    /// Move-to-front insert, deduplicated and capped at `recent_max`.
    pub fn add_recent(&self, path: &str) {
        {
            let mut data = self.write();
            data.dirs.recent.retain(|r| r != path);
            data.dirs.recent.insert(0, path.to_string());
            let max = self.inner.recent_max;
            data.dirs.recent.truncate(max);
        }
        self.trigger_save();
    }

    #[must_use]
    pub fn dirs(&self) -> DirState {
        self.read().dirs.clone()
    }

    // ─── Persistence ────────────────────────────────────────────────

    /// Synchronous flush to disk.
    pub fn save(&self) -> Result<()> {
        let bytes = {
            let data = self.read();
            serde_json::to_vec_pretty(&*data)?
        };
        write_atomic(&self.inner.path, &bytes)
    }

    /// Stop the persister and flush once more; reports write failures.
    pub fn close(&self) -> Result<()> {
        let _ = self.inner.done_tx.send(true);
        self.save()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StateData> {
        self.inner.data.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StateData> {
        self.inner.data.write().unwrap_or_else(|p| p.into_inner())
    }
}

async fn persist_loop(
    inner: Arc<Inner>,
    mut save_rx: mpsc::Receiver<()>,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            trigger = save_rx.recv() => {
                if trigger.is_none() {
                    return;
                }
            }
            _ = done_rx.changed() => return,
        }

        // Debounce: restart the window on every further trigger.
        loop {
            tokio::select! {
                () = tokio::time::sleep(DEBOUNCE) => break,
                trigger = save_rx.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                }
                _ = done_rx.changed() => return,
            }
        }

        let store = StateStore {
            inner: Arc::clone(&inner),
        };
        if let Err(e) = store.save() {
            error!(error = %e, "failed to save state");
        }
    }
}

/// Write `bytes` to `path` via a sibling temp file + rename, mode 0600.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("state.json")
    ));
    std::fs::write(&tmp, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::ChatKind;

    fn key(n: i64) -> TopicKey {
        TopicKey::new(n, ChatKind::Private, None)
    }

    fn binding(window: &str) -> Binding {
        Binding {
            window_id: window.into(),
            backend: BackendKind::Claude,
            project_path: "/tmp/proj".into(),
            display_name: "claude @ proj".into(),
            created_at: Utc::now(),
            status: BindingStatus::Running,
        }
    }

    #[tokio::test]
    async fn set_get_delete_binding() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json"), 10);

        store.set_binding(&key(1), binding("@1"));
        assert_eq!(store.get_binding(&key(1)).unwrap().window_id, "@1");
        assert!(store.get_binding(&key(2)).is_none());

        store.delete_binding(&key(1));
        assert!(store.get_binding(&key(1)).is_none());
    }

    #[tokio::test]
    async fn recent_dedupes_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json"), 3);

        for p in ["/a", "/b", "/a", "/c", "/d"] {
            store.add_recent(p);
        }
        let dirs = store.dirs();
        assert_eq!(dirs.recent, vec!["/d", "/c", "/a"]);
    }

    #[tokio::test]
    async fn favorites_are_duplicate_free() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json"), 10);

        store.add_favorite("/a");
        store.add_favorite("/a");
        store.add_favorite("/b");
        assert_eq!(store.dirs().favorites, vec!["/a", "/b"]);

        store.remove_favorite("/a");
        assert_eq!(store.dirs().favorites, vec!["/b"]);
    }

    #[tokio::test]
    async fn close_flushes_and_reopen_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(path.clone(), 10);
        store.set_binding(&key(5), binding("@9"));
        store.set_offset(
            &key(5),
            Offset {
                file: "/logs/s.jsonl".into(),
                byte_offset: 4242,
                message_count: 0,
            },
        );
        store.close().unwrap();

        let store2 = StateStore::open(path, 10);
        let b = store2.get_binding(&key(5)).unwrap();
        assert_eq!(b.window_id, "@9");
        let o = store2.get_offset(&key(5)).unwrap();
        assert_eq!(o.byte_offset, 4242);
        assert_eq!(o.file, "/logs/s.jsonl");
    }

    #[tokio::test]
    async fn debounced_flush_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(path.clone(), 10);
        store.set_binding(&key(1), binding("@1"));

        tokio::time::sleep(Duration::from_millis(900)).await;
        let bytes = std::fs::read(&path).expect("debounced save should have written the file");
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(doc["bindings"]["dm:1"].is_object());
    }

    #[tokio::test]
    async fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = StateStore::open(path, 10);
        assert!(store.all_bindings().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_is_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(path.clone(), 10);
        store.set_binding(&key(1), binding("@1"));
        store.close().unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
