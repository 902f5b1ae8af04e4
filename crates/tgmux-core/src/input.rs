//! Per-window input serializers.
//!
//! All terminal writes for a window flow through one queue with a single
//! worker, so input arrives strictly in enqueue order no matter how many
//! handlers produce it. Writers never block on tmux I/O; a full queue drops
//! the message with a warning (Telegram rate-limits user input far below the
//! queue capacity).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::tmux::MuxHandle;

const QUEUE_CAPACITY: usize = 100;

struct Serializer {
    tx: mpsc::Sender<String>,
    worker: JoinHandle<()>,
}

/// Owns the window→serializer map.
pub struct SerializerManager {
    mux: MuxHandle,
    serializers: Mutex<HashMap<String, Serializer>>,
}

impl SerializerManager {
    #[must_use]
    pub fn new(mux: MuxHandle) -> Self {
        Self {
            mux,
            serializers: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a serializer exists for `window_id`.
    pub fn ensure(&self, window_id: &str) {
        let mut map = self.lock();
        map.entry(window_id.to_string())
            .or_insert_with(|| self.spawn_worker(window_id));
    }

    /// Queue `text` for the window, creating the serializer on first use.
    pub fn enqueue(&self, window_id: &str, text: String) {
        let mut map = self.lock();
        let serializer = map
            .entry(window_id.to_string())
            .or_insert_with(|| self.spawn_worker(window_id));
        if serializer.tx.try_send(text).is_err() {
            warn!(window = %window_id, "input queue full, dropping message");
        }
    }

    /// Close the serializer for `window_id`; its worker finishes queued
    /// writes and exits. Safe when none exists.
    pub fn close(&self, window_id: &str) {
        // Dropping the sender lets the worker drain and stop.
        self.lock().remove(window_id);
    }

    /// Close every serializer and wait up to `timeout` for workers to finish
    /// their writes.
    pub async fn close_all(&self, timeout: Duration) {
        let workers: Vec<JoinHandle<()>> = {
            let mut map = self.lock();
            map.drain().map(|(_, s)| s.worker).collect()
        };
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("input serializer drain timed out");
        }
    }

    fn spawn_worker(&self, window_id: &str) -> Serializer {
        let (tx, mut rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
        let mux = Arc::clone(&self.mux);
        let window_id = window_id.to_string();
        let worker = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = mux.send_text(&window_id, &text).await {
                    error!(window = %window_id, error = %e, "send to tmux failed");
                }
            }
        });
        Serializer { tx, worker }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Serializer>> {
        self.serializers.lock().unwrap_or_else(|p| p.into_inner())
    }
}
