//! Status poller.
//!
//! For log-monitored backends the terminal itself is invisible to the chat:
//! output comes from session logs, not the pane. The status poller
//! periodically captures the pane's last line ("currently doing" spinners,
//! progress counters) and maintains a single edit-in-place `📊` message per
//! topic. Bash windows are skipped — their pane is already streamed by the
//! screen-diff monitor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::backend::BackendKind;
use crate::markup::{rune_count, truncate_runes};
use crate::pusher::PusherManager;
use crate::rate::RateGate;
use crate::state::{BindingStatus, StateStore};
use crate::telegram::{EditMessageParams, SendMessageParams, TgHandle};
use crate::tmux::MuxHandle;
use crate::topic::TopicKey;

const MAX_STATUS_RUNES: usize = 200;

#[derive(Debug, Default)]
struct StatusEntry {
    /// Message id of the status line; 0 before the first send.
    message_id: i64,
    last_text: String,
}

/// Periodic pane sampler maintaining one editable status message per topic.
pub struct StatusPoller {
    tg: TgHandle,
    mux: MuxHandle,
    pushers: Arc<PusherManager>,
    store: StateStore,
    gate: Arc<RateGate>,
    interval: Duration,
    statuses: Mutex<HashMap<TopicKey, StatusEntry>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl StatusPoller {
    /// `None` when the interval is not configured (poller disabled).
    #[must_use]
    pub fn new(
        tg: TgHandle,
        mux: MuxHandle,
        pushers: Arc<PusherManager>,
        store: StateStore,
        interval: Option<Duration>,
    ) -> Option<Arc<Self>> {
        let Some(interval) = interval else {
            info!("status poller disabled (status_poll_interval not configured)");
            return None;
        };
        let gate = pushers.gate();
        Some(Arc::new(Self {
            tg,
            mux,
            pushers,
            store,
            gate,
            interval,
            statuses: Mutex::new(HashMap::new()),
            stop_tx: Mutex::new(None),
        }))
    }

    /// Start the polling loop.
    pub fn start(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap_or_else(|p| p.into_inner()) = Some(stop_tx);

        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {}
                }
                poller.poll_all(&mut stop_rx).await;
            }
        });
        info!(interval = ?self.interval, "status poller started");
    }

    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = tx.send(true);
        }
    }

    /// Drop the cached status message for an unbound topic.
    pub fn remove_status(&self, key: &TopicKey) {
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }

    async fn poll_all(&self, cancel: &mut watch::Receiver<bool>) {
        for (key, binding) in self.store.all_bindings() {
            if binding.status == BindingStatus::Disconnected {
                continue;
            }
            // Bash panes are already streamed by the screen-diff monitor.
            if binding.backend == BackendKind::Bash {
                continue;
            }
            self.poll_one(&key, &binding.window_id, cancel).await;
        }
    }

    async fn poll_one(&self, key: &TopicKey, window_id: &str, cancel: &mut watch::Receiver<bool>) {
        // Fresh monitor output is flowing; a status line would be stale noise.
        if self.pushers.has_pending(key) {
            return;
        }

        let Ok(text) = self.mux.capture_pane_clean(window_id).await else {
            return;
        };
        let Some(status_text) = extract_status_line(&text) else {
            return;
        };

        let changed = {
            let mut statuses = self.statuses.lock().unwrap_or_else(|p| p.into_inner());
            let entry = statuses.entry(key.clone()).or_default();
            if entry.last_text == status_text {
                None
            } else {
                entry.last_text = status_text.clone();
                Some(entry.message_id)
            }
        };
        let Some(message_id) = changed else { return };

        if !self.gate.wait(cancel).await {
            return;
        }

        let display = format!("📊 {status_text}");
        if message_id == 0 {
            let params =
                SendMessageParams::text(key.chat_id(), key.thread_id(), display);
            if let Ok(new_id) = self.tg.send_message(params).await {
                let mut statuses = self.statuses.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(entry) = statuses.get_mut(key) {
                    entry.message_id = new_id;
                }
            }
        } else {
            let params = EditMessageParams {
                chat_id: key.chat_id(),
                message_id,
                text: display,
                parse_mode: None,
                disable_preview: false,
            };
            if let Err(e) = self.tg.edit_message_text(params).await {
                debug!(key = %key, error = %e, "status edit failed, will send new next time");
                let mut statuses = self.statuses.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(entry) = statuses.get_mut(key) {
                    entry.message_id = 0;
                }
            }
        }
    }
}

/// Last non-empty trimmed line of the pane, truncated to 200 runes.
fn extract_status_line(text: &str) -> Option<String> {
    let trimmed = text.trim_end_matches(['\n', ' ']);
    for line in trimmed.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if rune_count(line) > MAX_STATUS_RUNES {
            return Some(format!("{}…", truncate_runes(line, MAX_STATUS_RUNES)));
        }
        return Some(line.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_last_non_empty_line() {
        let pane = "old output\n\n✻ Thinking…\n   \n";
        assert_eq!(extract_status_line(pane), Some("✻ Thinking…".to_string()));
    }

    #[test]
    fn empty_pane_yields_none() {
        assert_eq!(extract_status_line(""), None);
        assert_eq!(extract_status_line("\n  \n"), None);
    }

    #[test]
    fn long_lines_are_truncated() {
        let pane = format!("{}\n", "x".repeat(300));
        let status = extract_status_line(&pane).unwrap();
        assert_eq!(rune_count(&status), MAX_STATUS_RUNES + 1);
        assert!(status.ends_with('…'));
    }
}
