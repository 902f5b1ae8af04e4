//! The session bridge controller and Telegram front-end.
//!
//! [`Bridge`] owns every per-topic resource: bindings (via the state store),
//! monitors (via the dispatcher), input serializers, pushers and interaction
//! state. It consumes the long-poll update stream, routes messages and
//! callbacks, and drives the create / adopt / recover / unbind lifecycle.
//!
//! Workers never reach back into the controller; the output handler closure
//! given to a monitor carries only the topic key and its destination chat.

pub mod keyboard;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::auth::AuthChecker;
use crate::backend::{self, BackendKind};
use crate::config::Config;
use crate::input::SerializerManager;
use crate::monitor::Dispatcher;
use crate::pusher::PusherManager;
use crate::state::{Binding, BindingStatus, StateStore};
use crate::status::StatusPoller;
use crate::telegram::{CallbackQuery, Message, SendMessageParams, TgHandle, Update};
use crate::tmux::MuxHandle;
use crate::topic::{ChatKind, TopicKey};

const LONG_POLL_SECS: u64 = 30;
const PHASE_EXPIRY: Duration = Duration::from_secs(5 * 60);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Multi-step creation flow state for one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingDir,
    AwaitingPathInput,
    AwaitingBackend,
    Bound,
}

#[derive(Debug)]
struct TopicState {
    phase: Phase,
    selected_dir: String,
    updated_at: Instant,
}

impl TopicState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            selected_dir: String::new(),
            updated_at: Instant::now(),
        }
    }
}

/// What to do with an inbound text for a bound topic.
#[derive(Debug, PartialEq, Eq)]
enum InboundRoute {
    /// `!`-prefixed: write directly to the pane, skipping the serializer.
    Bypass(String),
    /// Queue on the window's input serializer.
    Forward(String),
}

fn route_inbound(text: &str) -> InboundRoute {
    if let Some(rest) = text.strip_prefix('!') {
        let trimmed = rest.trim();
        if !trimmed.is_empty() {
            return InboundRoute::Bypass(trimmed.to_string());
        }
    }
    InboundRoute::Forward(text.to_string())
}

/// The bridge controller.
pub struct Bridge {
    cfg: Config,
    auth: AuthChecker,
    store: StateStore,
    mux: MuxHandle,
    tg: TgHandle,
    dispatcher: Dispatcher,
    pushers: Arc<PusherManager>,
    serializers: SerializerManager,
    status_poller: Option<Arc<StatusPoller>>,
    states: Mutex<HashMap<TopicKey, TopicState>>,
}

impl Bridge {
    #[must_use]
    pub fn new(cfg: Config, store: StateStore, mux: MuxHandle, tg: TgHandle) -> Arc<Self> {
        let auth = AuthChecker::new(&cfg.telegram.allowed_users);
        let dispatcher = Dispatcher::new(cfg.clone(), store.clone(), Arc::clone(&mux));
        let pushers = Arc::new(PusherManager::new(
            Arc::clone(&tg),
            cfg.security.redact_secrets,
        ));
        let serializers = SerializerManager::new(Arc::clone(&mux));
        let status_poller = StatusPoller::new(
            Arc::clone(&tg),
            Arc::clone(&mux),
            Arc::clone(&pushers),
            store.clone(),
            cfg.monitor.status_poll_interval(),
        );

        Arc::new(Self {
            cfg,
            auth,
            store,
            mux,
            tg,
            dispatcher,
            pushers,
            serializers,
            status_poller,
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Recover persisted bindings, start the status poller, and run the
    /// long-poll loop until `shutdown` fires.
    pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.recover_bindings().await;
        if let Some(poller) = &self.status_poller {
            poller.start();
        }

        info!("bot starting polling");
        let mut offset = 0i64;
        loop {
            let updates = tokio::select! {
                _ = shutdown.changed() => return,
                res = self.tg.get_updates(offset, LONG_POLL_SECS) => res,
            };

            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "getUpdates failed, retrying");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        () = tokio::time::sleep(Duration::from_secs(3)) => continue,
                    }
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                self.dispatch(update).await;
            }
        }
    }

    /// The monitor dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The pusher manager.
    #[must_use]
    pub fn pushers(&self) -> &Arc<PusherManager> {
        &self.pushers
    }

    /// Ordered teardown: serializers, monitors, pushers, state store.
    pub async fn shutdown(&self) {
        if let Some(poller) = &self.status_poller {
            poller.stop();
        }
        self.serializers.close_all(SHUTDOWN_DRAIN).await;
        self.dispatcher.stop_all();
        self.pushers.stop_all().await;
        if let Err(e) = self.store.close() {
            error!(error = %e, "failed to save state on close");
        }
    }

    // ─── Update routing ─────────────────────────────────────────────

    async fn dispatch(self: &Arc<Self>, update: Update) {
        if let Some(cq) = update.callback_query {
            if self.auth.is_allowed(cq.from.id) {
                self.handle_callback(cq).await;
            }
            return;
        }
        if let Some(msg) = update.message {
            let allowed = msg.from.as_ref().is_some_and(|u| self.auth.is_allowed(u.id));
            if !allowed {
                return;
            }
            if msg.forum_topic_closed.is_some() {
                self.handle_topic_closed(&msg).await;
                return;
            }
            let Some(text) = msg.text.clone() else { return };
            self.handle_text(&msg, &text).await;
        }
    }

    async fn handle_text(self: &Arc<Self>, msg: &Message, text: &str) {
        let command = text.split_whitespace().next().unwrap_or_default();
        match command {
            "/new" => self.handle_new(msg).await,
            "/session" => self.handle_session(msg, text).await,
            "/kill" => self.handle_kill(msg).await,
            "/esc" => self.handle_esc(msg).await,
            "/enter" => self.handle_enter(msg).await,
            "/screenshot" => self.handle_screenshot(msg).await,
            "/cmd" => self.handle_cmd(msg, text).await,
            "/dir" => self.handle_dir(msg, text).await,
            _ => self.default_handler(msg, text).await,
        }
    }

    async fn default_handler(self: &Arc<Self>, msg: &Message, text: &str) {
        let key = topic_key_from_message(msg);

        match self.phase(&key) {
            Phase::AwaitingPathInput => {
                self.accept_path_input(&key, msg, text).await;
                return;
            }
            Phase::AwaitingDir => {
                self.reply(msg, "Pick a directory button, or use [📁 Enter a path...]")
                    .await;
                return;
            }
            Phase::AwaitingBackend => {
                self.reply(msg, "Pick a backend button").await;
                return;
            }
            _ => {}
        }

        let Some(binding) = self.store.get_binding(&key) else {
            self.handle_unbound(&key, msg.chat.id, thread_id(msg)).await;
            return;
        };

        if !self
            .mux
            .is_window_alive(&binding.window_id)
            .await
            .unwrap_or(false)
        {
            info!(key = %key, window = %binding.window_id, "window dead, auto unbinding");
            self.unbind(&key, &binding).await;
            self.reply(msg, "⚠️ Session disconnected, unbound automatically")
                .await;
            self.handle_unbound(&key, msg.chat.id, thread_id(msg)).await;
            return;
        }

        // A bash session's backend is the shell itself.
        if binding.backend != BackendKind::Bash
            && !self
                .mux
                .is_backend_alive(&binding.window_id)
                .await
                .unwrap_or(false)
        {
            info!(key = %key, window = %binding.window_id, "backend exited, auto unbinding");
            self.unbind(&key, &binding).await;
            self.reply(msg, "⚠️ Backend exited, unbound automatically")
                .await;
            self.handle_unbound(&key, msg.chat.id, thread_id(msg)).await;
            return;
        }

        match route_inbound(text) {
            InboundRoute::Bypass(cmd) => {
                if let Err(e) = self.mux.send_keys(&binding.window_id, &cmd).await {
                    self.reply(msg, &format!("Failed to send command: {e}")).await;
                    return;
                }
                let _ = self.mux.send_enter(&binding.window_id).await;
            }
            InboundRoute::Forward(text) => {
                self.serializers.enqueue(&binding.window_id, text);
            }
        }
    }

    async fn accept_path_input(self: &Arc<Self>, key: &TopicKey, msg: &Message, text: &str) {
        let path = text.trim();
        if path.is_empty() {
            self.reply(msg, "Path cannot be empty, try again:").await;
            return;
        }
        let path = backend::expand_home(path);
        if !path.is_dir() {
            self.reply(
                msg,
                &format!("Directory does not exist: {}\nTry again:", path.display()),
            )
            .await;
            return;
        }
        self.set_selected_dir(key, path.to_string_lossy().into_owned());
        self.set_phase(key, Phase::AwaitingBackend);
        self.send_with_keyboard(
            msg.chat.id,
            thread_id(msg),
            "🚀 Pick a backend:",
            keyboard::backend_keyboard(&self.cfg),
        )
        .await;
    }

    async fn handle_unbound(self: &Arc<Self>, key: &TopicKey, chat_id: i64, thread_id: i64) {
        let windows = self.mux.list_windows().await.unwrap_or_default();
        if windows.is_empty() {
            self.start_new_flow(key, chat_id, thread_id).await;
            return;
        }

        let bindings = self.store.all_bindings();
        let bound: HashMap<&str, String> = bindings
            .iter()
            .map(|(tk, b)| (b.window_id.as_str(), tk.to_string()))
            .collect();

        let sessions: Vec<keyboard::SessionInfo> = windows
            .iter()
            .map(|w| keyboard::SessionInfo {
                window_id: w.id.clone(),
                display_name: w.name.clone(),
                bound_topic: bound.get(w.id.as_str()).cloned().unwrap_or_default(),
            })
            .collect();

        self.send_with_keyboard(
            chat_id,
            thread_id,
            "This topic has no session yet. Pick one:",
            keyboard::session_list_keyboard(&sessions),
        )
        .await;
    }

    async fn start_new_flow(self: &Arc<Self>, key: &TopicKey, chat_id: i64, thread_id: i64) {
        self.set_phase(key, Phase::AwaitingDir);
        let dirs = self.store.dirs();
        self.send_with_keyboard(
            chat_id,
            thread_id,
            "📂 Pick a project directory:",
            keyboard::dir_keyboard(&dirs.favorites, &dirs.recent),
        )
        .await;
    }

    // ─── Slash commands ─────────────────────────────────────────────

    async fn handle_new(self: &Arc<Self>, msg: &Message) {
        let key = topic_key_from_message(msg);
        self.start_new_flow(&key, msg.chat.id, thread_id(msg)).await;
    }

    async fn handle_session(self: &Arc<Self>, msg: &Message, text: &str) {
        let key = topic_key_from_message(msg);
        let arg = text.trim_start_matches("/session").trim();

        if arg == "list" {
            let windows = match self.mux.list_windows().await {
                Ok(w) => w,
                Err(e) => {
                    self.reply(msg, &format!("Failed to list windows: {e}")).await;
                    return;
                }
            };
            if windows.is_empty() {
                self.reply(msg, "🖥 No tmux windows").await;
                return;
            }
            let bindings = self.store.all_bindings();
            let bound: HashMap<&str, String> = bindings
                .iter()
                .map(|(tk, b)| (b.window_id.as_str(), tk.to_string()))
                .collect();
            let mut lines = vec!["🖥 All tmux windows\n".to_string()];
            for w in &windows {
                match bound.get(w.id.as_str()) {
                    Some(tk) => lines.push(format!("{}  {}  ← bound to {tk}", w.id, w.name)),
                    None => lines.push(format!("{}  {}  ← unbound", w.id, w.name)),
                }
            }
            self.reply(msg, &lines.join("\n")).await;
            return;
        }

        let Some(binding) = self.store.get_binding(&key) else {
            self.reply(msg, "This topic has no session\nUse /new to create one")
                .await;
            return;
        };
        let alive = if self
            .mux
            .is_window_alive(&binding.window_id)
            .await
            .unwrap_or(false)
        {
            "running"
        } else {
            "disconnected"
        };
        let age_minutes = (Utc::now() - binding.created_at).num_minutes();
        let reply = format!(
            "📋 Current session\n├─ window:  {}\n├─ backend: {}\n├─ dir:     {}\n├─ status:  {}\n└─ created: {}m ago",
            binding.window_id, binding.backend, binding.project_path, alive, age_minutes
        );
        self.reply(msg, &reply).await;
    }

    async fn handle_kill(self: &Arc<Self>, msg: &Message) {
        let key = topic_key_from_message(msg);
        let Some(binding) = self.store.get_binding(&key) else {
            self.reply(msg, "This topic has no session").await;
            return;
        };
        let _ = self.mux.kill_window(&binding.window_id).await;
        self.unbind(&key, &binding).await;
        self.reply(msg, &format!("✅ Session {} closed", binding.display_name))
            .await;
    }

    async fn handle_esc(self: &Arc<Self>, msg: &Message) {
        let key = topic_key_from_message(msg);
        let Some(binding) = self.store.get_binding(&key) else {
            self.reply(msg, "This topic has no session").await;
            return;
        };
        let _ = self.mux.send_escape(&binding.window_id).await;
        self.reply(msg, "⎋ Escape sent").await;
    }

    async fn handle_enter(self: &Arc<Self>, msg: &Message) {
        let key = topic_key_from_message(msg);
        let Some(binding) = self.store.get_binding(&key) else {
            self.reply(msg, "This topic has no session").await;
            return;
        };
        let _ = self.mux.send_enter(&binding.window_id).await;
    }

    async fn handle_screenshot(self: &Arc<Self>, msg: &Message) {
        let key = topic_key_from_message(msg);
        let Some(binding) = self.store.get_binding(&key) else {
            self.reply(msg, "This topic has no session").await;
            return;
        };
        self.send_screenshot(msg.chat.id, thread_id(msg), &binding.window_id)
            .await;
    }

    async fn handle_cmd(self: &Arc<Self>, msg: &Message, text: &str) {
        let key = topic_key_from_message(msg);
        let Some(binding) = self.store.get_binding(&key) else {
            self.reply(msg, "This topic has no session").await;
            return;
        };
        let arg = text.trim_start_matches("/cmd").trim();
        if arg.is_empty() {
            self.reply(msg, "Usage: /cmd <command>\ne.g. /cmd config").await;
            return;
        }
        // Forward as a backend-native slash command.
        self.serializers.enqueue(&binding.window_id, format!("/{arg}"));
    }

    async fn handle_dir(self: &Arc<Self>, msg: &Message, text: &str) {
        let arg = text.trim_start_matches("/dir").trim();

        if let Some(path) = arg.strip_prefix("add ") {
            let path = path.trim();
            if path.is_empty() {
                self.reply(msg, "Usage: /dir add <path>").await;
                return;
            }
            let expanded = backend::expand_home(path);
            self.store.add_favorite(&expanded.to_string_lossy());
            self.reply(msg, &format!("⭐ Added favorite: {path}")).await;
            return;
        }

        if let Some(path) = arg.strip_prefix("rm ") {
            let path = path.trim();
            if path.is_empty() {
                self.reply(msg, "Usage: /dir rm <path>").await;
                return;
            }
            let expanded = backend::expand_home(path);
            self.store.remove_favorite(&expanded.to_string_lossy());
            self.reply(msg, &format!("🗑 Removed favorite: {path}")).await;
            return;
        }

        if let Some(path) = arg.strip_prefix("browse").map(str::trim) {
            let path = if path.is_empty() {
                dirs::home_dir().unwrap_or_default().to_string_lossy().into_owned()
            } else {
                backend::expand_home(path).to_string_lossy().into_owned()
            };
            match list_subdirs(&path) {
                Ok(entries) => {
                    self.send_with_keyboard(
                        msg.chat.id,
                        thread_id(msg),
                        &format!("📂 {path}"),
                        keyboard::browse_dir_keyboard(&path, &entries),
                    )
                    .await;
                }
                Err(e) => self.reply(msg, &format!("Browse failed: {e}")).await,
            }
            return;
        }

        let dirs = self.store.dirs();
        let mut lines = vec!["📂 Directories\n".to_string()];
        if !dirs.favorites.is_empty() {
            lines.push("⭐ Favorites:".into());
            lines.extend(dirs.favorites.iter().map(|f| format!("  {f}")));
        }
        if !dirs.recent.is_empty() {
            lines.push("\n🕐 Recent:".into());
            lines.extend(dirs.recent.iter().map(|r| format!("  {r}")));
        }
        if dirs.favorites.is_empty() && dirs.recent.is_empty() {
            lines.push(
                "No directories yet\nUse /dir add <path> to add a favorite\nUse /dir browse to explore".into(),
            );
        }
        self.reply(msg, &lines.join("\n")).await;
    }

    // ─── Callbacks ──────────────────────────────────────────────────

    async fn handle_callback(self: &Arc<Self>, cq: CallbackQuery) {
        let Some(msg) = &cq.message else {
            warn!(data = ?cq.data, "callback without message, ignoring");
            return;
        };
        let key = topic_key_from_message(msg);
        let chat_id = msg.chat.id;
        let thread = thread_id(msg);
        let Some(data) = cq.data.clone() else { return };
        info!(key = %key, data = %data, "callback");

        let _ = self.tg.answer_callback_query(&cq.id).await;

        if let Some(kind) = data.strip_prefix("backend:") {
            let kind = BackendKind::parse(kind);
            self.create_session(&key, chat_id, thread, kind).await;
        } else if let Some(dir) = data.strip_prefix("dir:") {
            self.set_selected_dir(&key, dir.to_string());
            self.set_phase(&key, Phase::AwaitingBackend);
            self.send_with_keyboard(
                chat_id,
                thread,
                "🚀 Pick a backend:",
                keyboard::backend_keyboard(&self.cfg),
            )
            .await;
        } else if data == "dir_input" {
            self.set_phase(&key, Phase::AwaitingPathInput);
            self.send_text_msg(chat_id, thread, "Enter the full project directory path:")
                .await;
        } else if let Some(window_id) = data.strip_prefix("bind:") {
            self.bind_existing(&key, chat_id, thread, window_id).await;
        } else if data == "new_session" {
            self.start_new_flow(&key, chat_id, thread).await;
        } else if let Some(rest) = data.strip_prefix("confirm:") {
            if let Some((action, window_id)) = rest.split_once(':') {
                self.handle_confirm(window_id, action).await;
            }
        } else if let Some(dir) = data.strip_prefix("browse:") {
            if let Ok(entries) = list_subdirs(dir) {
                self.send_with_keyboard(
                    chat_id,
                    thread,
                    &format!("📂 {dir}"),
                    keyboard::browse_dir_keyboard(dir, &entries),
                )
                .await;
            }
        } else if let Some(dir) = data.strip_prefix("fav:") {
            self.store.add_favorite(dir);
            self.send_text_msg(chat_id, thread, &format!("⭐ Added favorite: {dir}"))
                .await;
        } else if let Some(window_id) = data.strip_prefix("kill:") {
            let _ = self.mux.kill_window(window_id).await;
            for (tk, bd) in self.store.all_bindings() {
                if bd.window_id == window_id {
                    self.unbind(&tk, &bd).await;
                }
            }
            self.send_text_msg(chat_id, thread, "✅ Window closed").await;
        } else if let Some(rest) = data.strip_prefix("ss:") {
            if let Some((action, window_id)) = rest.split_once(':') {
                self.handle_key_action(chat_id, thread, action, window_id).await;
            }
        } else if let Some(rest) = data.strip_prefix("nav:") {
            if let Some((action, window_id)) = rest.split_once(':') {
                self.handle_key_action(chat_id, thread, action, window_id).await;
            }
        }
    }

    // ─── Session lifecycle ──────────────────────────────────────────

    async fn create_session(
        self: &Arc<Self>,
        key: &TopicKey,
        chat_id: i64,
        thread: i64,
        kind: BackendKind,
    ) {
        let selected_dir = self.selected_dir(key);
        if selected_dir.is_empty() {
            self.send_text_msg(chat_id, thread, "Error: no directory selected")
                .await;
            return;
        }

        let be = backend::get(kind, &self.cfg);
        let dir_name = std::path::Path::new(&selected_dir)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| selected_dir.clone());
        let window_name = format!("{kind}-{dir_name}");

        let window_id = match self.mux.new_window(&window_name).await {
            Ok(id) => id,
            Err(e) => {
                self.send_text_msg(chat_id, thread, &format!("Failed to create window: {e}"))
                    .await;
                return;
            }
        };

        let _ = self
            .mux
            .send_keys(&window_id, &format!("cd {selected_dir}"))
            .await;
        let _ = self.mux.send_enter(&window_id).await;

        // Nested launches refuse to start while these are set.
        let _ = self
            .mux
            .send_keys(&window_id, "unset CLAUDECODE CLAUDE_CODE 2>/dev/null; true")
            .await;
        let _ = self.mux.send_enter(&window_id).await;

        if kind != BackendKind::Bash {
            if let Some(command) = be.command_line() {
                // Let cd + unset land before the backend starts.
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = self.mux.send_keys(&window_id, &command).await;
                let _ = self.mux.send_enter(&window_id).await;
            }
        }

        let binding = Binding {
            window_id: window_id.clone(),
            backend: kind,
            project_path: selected_dir.clone(),
            display_name: format!("{kind} @ {dir_name}"),
            created_at: Utc::now(),
            status: BindingStatus::Running,
        };
        self.store.set_binding(key, binding.clone());
        self.store.add_recent(&selected_dir);

        self.serializers.ensure(&window_id);
        self.start_monitor_for_binding(key, &binding, chat_id, thread);
        self.set_phase(key, Phase::Bound);

        self.send_text_msg(
            chat_id,
            thread,
            &format!("✅ Created {kind} session @ {selected_dir}"),
        )
        .await;
        info!(key = %key, backend = %kind, dir = %selected_dir, window = %window_id, "session created");
    }

    async fn bind_existing(
        self: &Arc<Self>,
        key: &TopicKey,
        chat_id: i64,
        thread: i64,
        window_id: &str,
    ) {
        if !self.mux.is_backend_alive(window_id).await.unwrap_or(false) {
            self.send_text_msg(
                chat_id,
                thread,
                "⚠️ The backend in that window has exited; cannot bind",
            )
            .await;
            return;
        }

        let windows = self.mux.list_windows().await.unwrap_or_default();
        let window_name = windows
            .iter()
            .find(|w| w.id == window_id)
            .map(|w| w.name.clone())
            .unwrap_or_default();

        let binding = Binding {
            window_id: window_id.to_string(),
            backend: BackendKind::Unknown,
            project_path: String::new(),
            display_name: window_name.clone(),
            created_at: Utc::now(),
            status: BindingStatus::Running,
        };
        self.store.set_binding(key, binding.clone());
        self.serializers.ensure(window_id);
        // Unknown backend: the dispatcher falls back to screen diffing.
        self.start_monitor_for_binding(key, &binding, chat_id, thread);
        self.set_phase(key, Phase::Bound);

        self.send_text_msg(
            chat_id,
            thread,
            &format!("🔗 Bound to window {window_id} ({window_name})"),
        )
        .await;
    }

    /// Recover persisted bindings after a restart.
    pub async fn recover_bindings(self: &Arc<Self>) {
        let bindings = self.store.all_bindings();
        if bindings.is_empty() {
            return;
        }
        info!(count = bindings.len(), "recovering bindings");

        for (key, mut binding) in bindings {
            if !self
                .mux
                .is_window_alive(&binding.window_id)
                .await
                .unwrap_or(false)
            {
                info!(key = %key, window = %binding.window_id, "window dead during recovery, marking disconnected");
                binding.status = BindingStatus::Disconnected;
                self.store.set_binding(&key, binding);
                continue;
            }

            let backend_alive = if binding.backend == BackendKind::Bash {
                true
            } else {
                self.mux
                    .is_backend_alive(&binding.window_id)
                    .await
                    .unwrap_or(false)
            };
            if !backend_alive {
                info!(key = %key, window = %binding.window_id, "backend exited during recovery, removing binding");
                self.store.delete_binding(&key);
                self.store.delete_offset(&key);
                continue;
            }

            self.serializers.ensure(&binding.window_id);
            self.start_monitor_for_binding(&key, &binding, key.chat_id(), key.thread_id());
            self.set_phase(&key, Phase::Bound);
            info!(key = %key, window = %binding.window_id, "binding recovered");
        }
    }

    fn start_monitor_for_binding(
        self: &Arc<Self>,
        key: &TopicKey,
        binding: &Binding,
        chat_id: i64,
        thread: i64,
    ) {
        let handler = self.pushers.output_handler(
            key.clone(),
            chat_id,
            thread,
            binding.window_id.clone(),
        );
        if let Err(e) = self.dispatcher.start_monitor(key, binding, handler) {
            error!(key = %key, error = %e, "failed to start monitor");
        }
    }

    /// Tear down every per-topic resource. Safe when nothing is active.
    async fn unbind(&self, key: &TopicKey, binding: &Binding) {
        self.store.delete_binding(key);
        self.store.delete_offset(key);
        self.serializers.close(&binding.window_id);
        self.dispatcher.stop_monitor(key);
        self.pushers.stop_pusher(key).await;
        if let Some(poller) = &self.status_poller {
            poller.remove_status(key);
        }
        self.set_phase(key, Phase::Idle);
    }

    async fn handle_topic_closed(self: &Arc<Self>, msg: &Message) {
        let key = topic_key_from_message(msg);
        let Some(binding) = self.store.get_binding(&key) else {
            return;
        };
        info!(key = %key, window = %binding.window_id, "topic closed, auto cleanup");
        let _ = self.mux.kill_window(&binding.window_id).await;
        self.unbind(&key, &binding).await;
    }

    async fn handle_confirm(&self, window_id: &str, action: &str) {
        match action {
            "yes" => {
                let _ = self.mux.send_keys(window_id, "y").await;
                let _ = self.mux.send_enter(window_id).await;
            }
            "no" => {
                let _ = self.mux.send_keys(window_id, "n").await;
                let _ = self.mux.send_enter(window_id).await;
            }
            "always" => {
                // Backend-specific "always allow" shortcut.
                let _ = self.mux.send_keys(window_id, "!").await;
                let _ = self.mux.send_enter(window_id).await;
            }
            _ => {}
        }
    }

    async fn handle_key_action(
        self: &Arc<Self>,
        chat_id: i64,
        thread: i64,
        action: &str,
        window_id: &str,
    ) {
        match action {
            "y" | "n" => {
                let _ = self.mux.send_keys(window_id, action).await;
                let _ = self.mux.send_enter(window_id).await;
            }
            "refresh" => {}
            _ => {
                if let Some(key_name) = special_key_name(action) {
                    let _ = self.mux.send_special_key(window_id, key_name).await;
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        self.send_screenshot(chat_id, thread, window_id).await;
    }

    async fn send_screenshot(self: &Arc<Self>, chat_id: i64, thread: i64, window_id: &str) {
        let kb = keyboard::screenshot_keyboard(window_id);

        match self.mux.render_screenshot(window_id).await {
            Ok(png) => {
                if let Err(e) = self.tg.send_photo(chat_id, thread, png, Some(kb)).await {
                    warn!(error = %e, "sendPhoto failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "screenshot render failed, falling back to text");
                let Ok(text) = self.mux.capture_pane_clean(window_id).await else {
                    return;
                };
                let tail = tail_chars(&text, 4000);
                let params = SendMessageParams {
                    chat_id,
                    thread_id: thread,
                    text: format!("```\n{tail}\n```"),
                    parse_mode: None,
                    reply_markup: Some(kb),
                    disable_preview: true,
                };
                if let Err(e) = self.tg.send_message(params).await {
                    warn!(error = %e, "screenshot text fallback failed");
                }
            }
        }
    }

    // ─── Interaction state ──────────────────────────────────────────

    fn phase(&self, key: &TopicKey) -> Phase {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let state = states.entry(key.clone()).or_insert_with(TopicState::new);
        // Stuck mid-flow states expire back to idle.
        if state.phase != Phase::Idle
            && state.phase != Phase::Bound
            && state.updated_at.elapsed() > PHASE_EXPIRY
        {
            state.phase = Phase::Idle;
            state.selected_dir.clear();
        }
        state.phase
    }

    fn set_phase(&self, key: &TopicKey, phase: Phase) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let state = states.entry(key.clone()).or_insert_with(TopicState::new);
        state.phase = phase;
        state.updated_at = Instant::now();
    }

    fn selected_dir(&self, key: &TopicKey) -> String {
        let states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        states
            .get(key)
            .map(|s| s.selected_dir.clone())
            .unwrap_or_default()
    }

    fn set_selected_dir(&self, key: &TopicKey, dir: String) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let state = states.entry(key.clone()).or_insert_with(TopicState::new);
        state.selected_dir = dir;
        state.updated_at = Instant::now();
    }

    // ─── Send helpers ───────────────────────────────────────────────

    async fn reply(&self, msg: &Message, text: &str) {
        self.send_text_msg(msg.chat.id, thread_id(msg), text).await;
    }

    async fn send_text_msg(&self, chat_id: i64, thread: i64, text: &str) {
        let params = SendMessageParams::text(chat_id, thread, text);
        if let Err(e) = self.tg.send_message(params).await {
            warn!(error = %e, "sendMessage failed");
        }
    }

    async fn send_with_keyboard(
        &self,
        chat_id: i64,
        thread: i64,
        text: &str,
        kb: crate::telegram::InlineKeyboardMarkup,
    ) {
        let params = SendMessageParams {
            chat_id,
            thread_id: thread,
            text: text.to_string(),
            parse_mode: None,
            reply_markup: Some(kb),
            disable_preview: false,
        };
        if let Err(e) = self.tg.send_message(params).await {
            warn!(error = %e, "sendMessage failed");
        }
    }
}

fn special_key_name(action: &str) -> Option<&'static str> {
    match action {
        "up" => Some("Up"),
        "down" => Some("Down"),
        "left" => Some("Left"),
        "right" => Some("Right"),
        "enter" => Some("Enter"),
        "esc" => Some("Escape"),
        "tab" => Some("Tab"),
        "space" => Some("Space"),
        "ctrlc" => Some("C-c"),
        _ => None,
    }
}

/// Topic key for an incoming message.
#[must_use]
pub fn topic_key_from_message(msg: &Message) -> TopicKey {
    let kind = if msg.chat.kind == "private" {
        ChatKind::Private
    } else {
        ChatKind::Group
    };
    TopicKey::new(msg.chat.id, kind, msg.message_thread_id)
}

fn thread_id(msg: &Message) -> i64 {
    msg.message_thread_id.unwrap_or(0)
}

/// Last `max_chars` characters of `text`.
fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map_or(0, |(i, _)| i);
    &text[start..]
}

fn list_subdirs(path: &str) -> std::io::Result<Vec<String>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && !name.starts_with('.') {
            dirs.push(name);
        }
    }
    dirs.sort();
    Ok(dirs)
}
