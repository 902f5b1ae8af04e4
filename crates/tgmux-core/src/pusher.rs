//! Per-topic outbound message queues.
//!
//! Monitors produce [`ParsedContent`] blocks; each bound topic has one
//! [`StreamPusher`] draining a bounded queue into Telegram. The worker merges
//! consecutive text blocks, redacts secrets, converts markdown to Telegram
//! HTML, splits oversized messages, retries through the global [`RateGate`],
//! and edits tool-use messages in place when their results arrive.
//!
//! Producers never block: a full queue drops the task with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::bot::keyboard;
use crate::markup::{escape_html, rune_count, split_message, to_html, truncate_runes, MESSAGE_LIMIT};
use crate::monitor::{ContentKind, OutputHandler, ParsedContent};
use crate::monitor::prompts::{detect_confirm_prompt, detect_interactive_ui};
use crate::rate::RateGate;
use crate::sanitize::redact;
use crate::telegram::{
    EditMessageParams, InlineKeyboardMarkup, SendMessageParams, TgHandle,
};
use crate::topic::TopicKey;

const QUEUE_CAPACITY: usize = 100;
const MERGE_LIMIT_RUNES: usize = 3800;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One queued outbound message.
#[derive(Debug, Clone)]
pub struct MessageTask {
    pub text: String,
    pub kind: ContentKind,
    /// Correlation key for tool_use / tool_result pairing.
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
    /// Inline keyboard; tasks carrying one are sent as plain text.
    pub reply_markup: Option<InlineKeyboardMarkup>,
}

impl MessageTask {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: ContentKind::Text,
            tool_use_id: None,
            tool_name: None,
            reply_markup: None,
        }
    }

    fn mergeable_with(&self, first_kind: ContentKind) -> bool {
        self.kind == first_kind && self.reply_markup.is_none()
    }
}

/// Queue + worker delivering one topic's output to Telegram.
pub struct StreamPusher {
    tx: mpsc::Sender<MessageTask>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    chat_id: i64,
}

impl StreamPusher {
    fn start(
        chat_id: i64,
        thread_id: i64,
        tg: TgHandle,
        gate: Arc<RateGate>,
        redact_secrets: bool,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker {
            chat_id,
            thread_id,
            tg,
            gate,
            redact_secrets,
            tool_messages: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run(rx, stop_rx));
        Self {
            tx,
            stop_tx,
            worker: Mutex::new(Some(handle)),
            chat_id,
        }
    }

    /// Queue a task; drops with a warning when the queue is full.
    pub fn enqueue(&self, task: MessageTask) {
        if self.tx.try_send(task).is_err() {
            warn!(chat = self.chat_id, "message queue full, dropping");
        }
    }

    /// Number of queued tasks not yet picked up by the worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Signal the worker to stop and wait for its bounded drain.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct Worker {
    chat_id: i64,
    thread_id: i64,
    tg: TgHandle,
    gate: Arc<RateGate>,
    redact_secrets: bool,
    /// tool_use_id → (message id, sent text, tool name); worker-local.
    tool_messages: HashMap<String, (i64, String, String)>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<MessageTask>, mut stop_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                task = rx.recv() => {
                    let Some(task) = task else { break };
                    let (merged, overflow) = try_merge(task, &mut rx);
                    self.deliver(&merged, &mut stop_rx).await;
                    if let Some(overflow) = overflow {
                        self.deliver(&overflow, &mut stop_rx).await;
                    }
                }
            }
        }
        self.drain(rx).await;
    }

    /// Best-effort drain after cancellation, bounded by [`DRAIN_TIMEOUT`].
    async fn drain(&mut self, mut rx: mpsc::Receiver<MessageTask>) {
        // A fresh cancel channel: the drain itself must not be interrupted
        // by the stop signal that triggered it.
        let (_tx, mut cancel) = watch::channel(false);
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while let Ok(task) = rx.try_recv() {
            if tokio::time::Instant::now() >= deadline {
                warn!(chat = self.chat_id, "pusher drain timed out");
                return;
            }
            self.deliver(&task, &mut cancel).await;
        }
    }

    async fn deliver(&mut self, task: &MessageTask, cancel: &mut watch::Receiver<bool>) {
        let text = redact(&task.text, self.redact_secrets);
        if text.trim().is_empty() {
            return;
        }

        // A tool result pairs with its tool_use message via an in-place edit.
        if task.kind == ContentKind::ToolResult {
            if let Some(id) = &task.tool_use_id {
                if let Some((message_id, sent_text, _name)) = self.tool_messages.remove(id) {
                    self.edit_tool_message(message_id, &sent_text, &text, cancel)
                        .await;
                    return;
                }
            }
        }

        let chunks = split_message(&text, MESSAGE_LIMIT);
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            if !self.gate.wait(cancel).await {
                return;
            }

            let (formatted, parse_mode) = match (&task.reply_markup, task.kind) {
                (Some(_), _) => (chunk, None),
                (None, ContentKind::Text) => (to_html(&chunk), Some("HTML".to_string())),
                // Thinking text is wrapped in HTML by the output handler.
                (None, ContentKind::Thinking) => (chunk, Some("HTML".to_string())),
                (None, ContentKind::ToolUse | ContentKind::ToolResult) => {
                    (escape_html(&chunk), Some("HTML".to_string()))
                }
            };

            let params = SendMessageParams {
                chat_id: self.chat_id,
                thread_id: self.thread_id,
                text: formatted.clone(),
                parse_mode,
                reply_markup: task.reply_markup.clone(),
                disable_preview: true,
            };

            match self.send_with_retry(params, cancel).await {
                Ok(message_id) => {
                    if task.kind == ContentKind::ToolUse && i == last {
                        if let Some(id) = &task.tool_use_id {
                            self.tool_messages.insert(
                                id.clone(),
                                (
                                    message_id,
                                    formatted,
                                    task.tool_name.clone().unwrap_or_default(),
                                ),
                            );
                        }
                    }
                }
                Err(e) => {
                    error!(chat = self.chat_id, error = %e, "sendMessage failed");
                    return;
                }
            }
        }
    }

    async fn edit_tool_message(
        &mut self,
        message_id: i64,
        sent_text: &str,
        result_text: &str,
        cancel: &mut watch::Receiver<bool>,
    ) {
        if !self.gate.wait(cancel).await {
            return;
        }

        let escaped = escape_html(result_text);
        let mut new_text = if sent_text.is_empty() {
            escaped.clone()
        } else {
            format!("{sent_text}\n{escaped}")
        };
        if rune_count(&new_text) > MESSAGE_LIMIT {
            new_text = format!("{}…", truncate_runes(&new_text, MESSAGE_LIMIT - 3));
        }

        let params = EditMessageParams {
            chat_id: self.chat_id,
            message_id,
            text: new_text,
            parse_mode: Some("HTML".to_string()),
            disable_preview: true,
        };

        if let Err(e) = self.edit_with_retry(params, cancel).await {
            warn!(chat = self.chat_id, error = %e, "editMessageText failed, sending as new message");
            let params = SendMessageParams {
                chat_id: self.chat_id,
                thread_id: self.thread_id,
                text: escaped,
                parse_mode: Some("HTML".to_string()),
                reply_markup: None,
                disable_preview: true,
            };
            let _ = self.send_with_retry(params, cancel).await;
        }
    }

    /// Send with one retry for throttling (after backing off the global
    /// gate) and one retry without parse mode on formatting rejections.
    async fn send_with_retry(
        &self,
        mut params: SendMessageParams,
        cancel: &mut watch::Receiver<bool>,
    ) -> crate::error::Result<i64> {
        match self.tg.send_message(params.clone()).await {
            Ok(id) => return Ok(id),
            Err(e) => {
                if let Some(retry_after) = throttle_secs(&e) {
                    self.gate.backoff(retry_after);
                    if !self.gate.wait(cancel).await {
                        return Err(e);
                    }
                    return self.tg.send_message(params).await;
                }
                if params.parse_mode.is_some() {
                    warn!(error = %e, "send with parse mode failed, retrying plain");
                    params.parse_mode = None;
                    return self.tg.send_message(params).await;
                }
                Err(e)
            }
        }
    }

    async fn edit_with_retry(
        &self,
        mut params: EditMessageParams,
        cancel: &mut watch::Receiver<bool>,
    ) -> crate::error::Result<()> {
        match self.tg.edit_message_text(params.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if let Some(retry_after) = throttle_secs(&e) {
                    self.gate.backoff(retry_after);
                    if !self.gate.wait(cancel).await {
                        return Err(e);
                    }
                    return self.tg.edit_message_text(params).await;
                }
                if params.parse_mode.is_some() {
                    warn!(error = %e, "edit with parse mode failed, retrying plain");
                    params.parse_mode = None;
                    return self.tg.edit_message_text(params).await;
                }
                Err(e)
            }
        }
    }
}

fn throttle_secs(err: &crate::error::Error) -> Option<u64> {
    match err {
        crate::error::Error::Telegram(tg) => tg.retry_after(),
        _ => None,
    }
}

/// Merge consecutive same-kind text tasks from the queue, up to
/// [`MERGE_LIMIT_RUNES`]. Returns the merged task and, when a peeked task
/// could not be merged, that task to send next.
fn try_merge(
    first: MessageTask,
    rx: &mut mpsc::Receiver<MessageTask>,
) -> (MessageTask, Option<MessageTask>) {
    if !matches!(first.kind, ContentKind::Text | ContentKind::Thinking)
        || first.reply_markup.is_some()
    {
        return (first, None);
    }

    let kind = first.kind;
    let mut text = first.text;
    loop {
        match rx.try_recv() {
            Ok(next) => {
                if !next.mergeable_with(kind)
                    || rune_count(&text) + rune_count(&next.text) + 2 > MERGE_LIMIT_RUNES
                {
                    let merged = MessageTask {
                        text,
                        kind,
                        tool_use_id: None,
                        tool_name: None,
                        reply_markup: None,
                    };
                    return (merged, Some(next));
                }
                text.push_str("\n\n");
                text.push_str(&next.text);
            }
            Err(_) => {
                let merged = MessageTask {
                    text,
                    kind,
                    tool_use_id: None,
                    tool_name: None,
                    reply_markup: None,
                };
                return (merged, None);
            }
        }
    }
}

/// Owns all per-topic pushers and the shared rate gate.
pub struct PusherManager {
    tg: TgHandle,
    gate: Arc<RateGate>,
    redact_secrets: bool,
    pushers: Mutex<HashMap<TopicKey, Arc<StreamPusher>>>,
}

impl PusherManager {
    #[must_use]
    pub fn new(tg: TgHandle, redact_secrets: bool) -> Self {
        Self {
            tg,
            gate: Arc::new(RateGate::new()),
            redact_secrets,
            pushers: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide rate gate.
    #[must_use]
    pub fn gate(&self) -> Arc<RateGate> {
        Arc::clone(&self.gate)
    }

    /// Existing pusher for `key`, or a freshly started one.
    pub fn get_or_create(&self, key: &TopicKey, chat_id: i64, thread_id: i64) -> Arc<StreamPusher> {
        let mut pushers = self.lock();
        if let Some(p) = pushers.get(key) {
            return Arc::clone(p);
        }
        let pusher = Arc::new(StreamPusher::start(
            chat_id,
            thread_id,
            Arc::clone(&self.tg),
            Arc::clone(&self.gate),
            self.redact_secrets,
        ));
        pushers.insert(key.clone(), Arc::clone(&pusher));
        pusher
    }

    /// Stop and forget the pusher for `key`, draining its queue.
    pub async fn stop_pusher(&self, key: &TopicKey) {
        let pusher = self.lock().remove(key);
        if let Some(pusher) = pusher {
            pusher.stop().await;
        }
    }

    /// Stop every pusher. Each drains for up to 5 seconds.
    pub async fn stop_all(&self) {
        let all: Vec<Arc<StreamPusher>> = {
            let mut pushers = self.lock();
            pushers.drain().map(|(_, p)| p).collect()
        };
        for pusher in all {
            pusher.stop().await;
        }
    }

    /// Whether `key`'s queue currently holds unsent tasks.
    #[must_use]
    pub fn has_pending(&self, key: &TopicKey) -> bool {
        self.lock().get(key).is_some_and(|p| p.pending() > 0)
    }

    /// Build the output handler wired to `key`'s chat and window.
    ///
    /// The handler inspects raw monitor output for interactive prompts
    /// (sending a control keyboard ahead of the content), then queues the
    /// block on the topic's pusher. This closure is the only upward
    /// reference a monitor holds.
    #[must_use]
    pub fn output_handler(
        self: &Arc<Self>,
        key: TopicKey,
        chat_id: i64,
        thread_id: i64,
        window_id: String,
    ) -> OutputHandler {
        let manager = Arc::clone(self);
        Arc::new(move |_key: &TopicKey, content: ParsedContent| {
            let pusher = manager.get_or_create(&key, chat_id, thread_id);

            if detect_interactive_ui(&content.text) {
                pusher.enqueue(MessageTask {
                    text: "🎮 Interactive UI detected:".into(),
                    kind: ContentKind::Text,
                    tool_use_id: None,
                    tool_name: None,
                    reply_markup: Some(keyboard::interactive_keyboard(&window_id)),
                });
            } else if detect_confirm_prompt(&content.text) {
                pusher.enqueue(MessageTask {
                    text: "🔐 Permission confirmation requested:".into(),
                    kind: ContentKind::Text,
                    tool_use_id: None,
                    tool_name: None,
                    reply_markup: Some(keyboard::confirm_keyboard(&window_id)),
                });
            }

            let task = match content.kind {
                ContentKind::Thinking => MessageTask {
                    text: format!(
                        "<blockquote expandable>💭 {}</blockquote>",
                        escape_html(&content.text)
                    ),
                    kind: ContentKind::Thinking,
                    tool_use_id: None,
                    tool_name: None,
                    reply_markup: None,
                },
                ContentKind::Text => MessageTask::text(content.text),
                ContentKind::ToolUse => MessageTask {
                    text: format!("🔧 {}", content.text),
                    kind: ContentKind::ToolUse,
                    tool_use_id: content.tool_use_id,
                    tool_name: content.tool_name,
                    reply_markup: None,
                },
                ContentKind::ToolResult => MessageTask {
                    text: content.text,
                    kind: ContentKind::ToolResult,
                    tool_use_id: content.tool_use_id,
                    tool_name: content.tool_name,
                    reply_markup: None,
                },
            };
            pusher.enqueue(task);
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TopicKey, Arc<StreamPusher>>> {
        self.pushers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_concatenates_same_kind() {
        let (tx, mut rx) = mpsc::channel(10);
        tx.try_send(MessageTask::text("b")).unwrap();
        tx.try_send(MessageTask::text("c")).unwrap();

        let (merged, overflow) = try_merge(MessageTask::text("a"), &mut rx);
        assert_eq!(merged.text, "a\n\nb\n\nc");
        assert!(overflow.is_none());
    }

    #[test]
    fn merge_stops_at_kind_boundary() {
        let (tx, mut rx) = mpsc::channel(10);
        tx.try_send(MessageTask::text("b")).unwrap();
        let tool = MessageTask {
            text: "🔧 Bash(ls)".into(),
            kind: ContentKind::ToolUse,
            tool_use_id: Some("u1".into()),
            tool_name: Some("Bash".into()),
            reply_markup: None,
        };
        tx.try_send(tool).unwrap();

        let (merged, overflow) = try_merge(MessageTask::text("a"), &mut rx);
        assert_eq!(merged.text, "a\n\nb");
        assert_eq!(overflow.unwrap().kind, ContentKind::ToolUse);
    }

    #[test]
    fn merge_respects_rune_budget() {
        let (tx, mut rx) = mpsc::channel(10);
        tx.try_send(MessageTask::text("y".repeat(2000))).unwrap();

        let (merged, overflow) = try_merge(MessageTask::text("x".repeat(2000)), &mut rx);
        assert_eq!(rune_count(&merged.text), 2000);
        assert_eq!(rune_count(&overflow.unwrap().text), 2000);
    }

    #[test]
    fn tool_use_is_never_merged() {
        let (_tx, mut rx) = mpsc::channel::<MessageTask>(10);
        let tool = MessageTask {
            text: "🔧 Read(x)".into(),
            kind: ContentKind::ToolUse,
            tool_use_id: Some("u1".into()),
            tool_name: Some("Read".into()),
            reply_markup: None,
        };
        let (merged, overflow) = try_merge(tool, &mut rx);
        assert_eq!(merged.kind, ContentKind::ToolUse);
        assert!(overflow.is_none());
    }
}
