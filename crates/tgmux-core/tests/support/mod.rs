//! Test doubles for the tmux and Telegram surfaces.

// Shared across test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tgmux_core::error::{Error, TelegramError};
use tgmux_core::telegram::{
    BotInfo, EditMessageParams, InlineKeyboardMarkup, SendMessageParams, TelegramApi, TgFuture,
    Update,
};
use tgmux_core::tmux::{Multiplexer, MuxFuture, WindowInfo};

// ─── Mock multiplexer ───────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MuxState {
    /// Windows present in the session.
    pub windows: Vec<WindowInfo>,
    /// window id → pane command, for liveness probes.
    pub pane_commands: HashMap<String, String>,
    /// window id → pane content returned by capture.
    pub pane_contents: HashMap<String, String>,
    /// Every mutation call, recorded as `op window payload`.
    pub calls: Vec<String>,
    next_window: u64,
}

/// Scriptable in-memory tmux.
#[derive(Debug, Default)]
pub struct MockMux {
    pub state: Mutex<MuxState>,
}

impl MockMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a window with the given pane command.
    pub fn add_window(&self, id: &str, name: &str, pane_command: &str) {
        let mut state = self.state.lock().unwrap();
        state.windows.push(WindowInfo {
            id: id.to_string(),
            name: name.to_string(),
        });
        state
            .pane_commands
            .insert(id.to_string(), pane_command.to_string());
    }

    pub fn set_pane_content(&self, id: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .pane_contents
            .insert(id.to_string(), content.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, entry: String) {
        self.state.lock().unwrap().calls.push(entry);
    }
}

impl Multiplexer for MockMux {
    fn ensure_session(&self) -> MuxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn new_window<'a>(&'a self, name: &'a str) -> MuxFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.next_window += 1;
            let id = format!("@{}", state.next_window);
            state.windows.push(WindowInfo {
                id: id.clone(),
                name: name.to_string(),
            });
            state.pane_commands.insert(id.clone(), "bash".to_string());
            state.calls.push(format!("new_window {name}"));
            Ok(id)
        })
    }

    fn kill_window<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.windows.retain(|w| w.id != window_id);
            state.calls.push(format!("kill_window {window_id}"));
            Ok(())
        })
    }

    fn send_keys<'a>(&'a self, window_id: &'a str, text: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("send_keys {window_id} {text}"));
            Ok(())
        })
    }

    fn send_enter<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("send_enter {window_id}"));
            Ok(())
        })
    }

    fn send_escape<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("send_escape {window_id}"));
            Ok(())
        })
    }

    fn send_special_key<'a>(&'a self, window_id: &'a str, key_name: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("send_special_key {window_id} {key_name}"));
            Ok(())
        })
    }

    fn send_text<'a>(&'a self, window_id: &'a str, text: &'a str) -> MuxFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("send_text {window_id} {text}"));
            Ok(())
        })
    }

    fn capture_pane_raw<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, String> {
        self.capture_pane_clean(window_id)
    }

    fn capture_pane_clean<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, String> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(state
                .pane_contents
                .get(window_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn list_windows(&self) -> MuxFuture<'_, Vec<WindowInfo>> {
        Box::pin(async {
            let state = self.state.lock().unwrap();
            Ok(state.windows.clone())
        })
    }

    fn is_window_alive<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, bool> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(state.windows.iter().any(|w| w.id == window_id))
        })
    }

    fn pane_command<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, String> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(state
                .pane_commands
                .get(window_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn is_backend_alive<'a>(&'a self, window_id: &'a str) -> MuxFuture<'a, bool> {
        Box::pin(async move {
            let proc = self.pane_command(window_id).await?;
            Ok(tgmux_core::tmux::backend_process_alive(&proc))
        })
    }

    fn render_screenshot<'a>(&'a self, _window_id: &'a str) -> MuxFuture<'a, Vec<u8>> {
        Box::pin(async {
            Err(tgmux_core::error::TmuxError::ScreenshotUnavailable("mock".into()).into())
        })
    }
}

// ─── Mock Telegram ──────────────────────────────────────────────────

/// One recorded outbound call.
#[derive(Debug, Clone)]
pub enum TgCall {
    Send {
        text: String,
        parse_mode: Option<String>,
        has_markup: bool,
        message_id: i64,
    },
    Edit {
        message_id: i64,
        text: String,
    },
}

#[derive(Debug, Default)]
struct TgState {
    calls: Vec<TgCall>,
    next_message_id: i64,
    /// Errors to return for upcoming sendMessage calls, in order.
    send_failures: Vec<TelegramError>,
    /// Errors to return for upcoming editMessageText calls, in order.
    edit_failures: Vec<TelegramError>,
    /// Updates handed to the next getUpdates call.
    pending_updates: Vec<Update>,
    next_update_id: i64,
}

/// Recording Telegram API with scriptable failures.
#[derive(Debug, Default)]
pub struct MockTelegram {
    state: Mutex<TgState>,
}

impl MockTelegram {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue an error for the next sendMessage call.
    pub fn fail_next_send(&self, err: TelegramError) {
        self.state.lock().unwrap().send_failures.push(err);
    }

    /// Queue an error for the next editMessageText call.
    pub fn fail_next_edit(&self, err: TelegramError) {
        self.state.lock().unwrap().edit_failures.push(err);
    }

    pub fn calls(&self) -> Vec<TgCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Texts of sendMessage calls, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TgCall::Send { text, .. } => Some(text),
                TgCall::Edit { .. } => None,
            })
            .collect()
    }

    pub fn throttle_error(retry_after: u64) -> TelegramError {
        TelegramError::Api {
            code: 429,
            description: "Too Many Requests".into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn format_error() -> TelegramError {
        TelegramError::Api {
            code: 400,
            description: "Bad Request: can't parse entities".into(),
            retry_after: None,
        }
    }

    /// Queue an incoming text message for the poll loop.
    pub fn push_text_message(&self, chat_id: i64, chat_kind: &str, user_id: i64, text: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_update_id += 1;
        let update = Update {
            update_id: state.next_update_id,
            message: Some(tgmux_core::telegram::Message {
                message_id: state.next_update_id,
                chat: tgmux_core::telegram::Chat {
                    id: chat_id,
                    kind: chat_kind.to_string(),
                },
                message_thread_id: None,
                from: Some(tgmux_core::telegram::User {
                    id: user_id,
                    username: None,
                }),
                text: Some(text.to_string()),
                forum_topic_closed: None,
            }),
            callback_query: None,
        };
        state.pending_updates.push(update);
    }
}

impl TelegramApi for MockTelegram {
    fn get_me(&self) -> TgFuture<'_, BotInfo> {
        Box::pin(async {
            Ok(BotInfo {
                id: 1,
                username: Some("mock_bot".into()),
            })
        })
    }

    fn get_updates(&self, _offset: i64, _timeout_secs: u64) -> TgFuture<'_, Vec<Update>> {
        Box::pin(async {
            let pending = {
                let mut state = self.state.lock().unwrap();
                std::mem::take(&mut state.pending_updates)
            };
            if pending.is_empty() {
                // Simulate the long-poll holding the connection open.
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
            Ok(pending)
        })
    }

    fn send_message(&self, params: SendMessageParams) -> TgFuture<'_, i64> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if !state.send_failures.is_empty() {
                let err = state.send_failures.remove(0);
                return Err(Error::Telegram(err));
            }
            state.next_message_id += 1;
            let id = state.next_message_id;
            state.calls.push(TgCall::Send {
                text: params.text,
                parse_mode: params.parse_mode,
                has_markup: params.reply_markup.is_some(),
                message_id: id,
            });
            Ok(id)
        })
    }

    fn edit_message_text(&self, params: EditMessageParams) -> TgFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if !state.edit_failures.is_empty() {
                let err = state.edit_failures.remove(0);
                return Err(Error::Telegram(err));
            }
            state.calls.push(TgCall::Edit {
                message_id: params.message_id,
                text: params.text,
            });
            Ok(())
        })
    }

    fn send_photo(
        &self,
        _chat_id: i64,
        _thread_id: i64,
        _png: Vec<u8>,
        _reply_markup: Option<InlineKeyboardMarkup>,
    ) -> TgFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn answer_callback_query<'a>(&'a self, _callback_id: &'a str) -> TgFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Await until `cond` holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    cond()
}
