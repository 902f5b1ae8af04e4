//! tgmux-core: bridge Telegram topics to tmux-hosted coding agents.
//!
//! Each Telegram topic (a private chat or a forum thread) is bound one-to-one
//! to a named window inside a persistent tmux session. The window runs one of
//! the supported interactive backends (claude, codex, gemini, or a plain
//! shell). User messages are written into the window's terminal; backend
//! output is extracted by a per-topic monitor and delivered back to the chat
//! through a rate-limited send queue.
//!
//! # Architecture
//!
//! ```text
//! Telegram long-poll → Bridge controller → input serializer → tmux window
//!                                ↑                                ↓
//!                        pusher (per topic) ← monitor (per topic) ┘
//!                                ↓
//!                        Telegram sendMessage / editMessageText
//! ```
//!
//! # Modules
//!
//! - `tmux`: tmux CLI client behind the [`tmux::Multiplexer`] trait
//! - `telegram`: Telegram Bot API client behind the [`telegram::TelegramApi`] trait
//! - `backend`: backend descriptor table (commands, log directory resolvers)
//! - `monitor`: output monitors (append-log, whole-file diff, screen diff)
//! - `pusher`: per-topic outbound message queue with merging and pairing
//! - `input`: per-window serialized terminal writers
//! - `state`: durable topic→binding / read-offset store
//! - `bot`: the bridge controller and Telegram front-end
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod auth;
pub mod backend;
pub mod bot;
pub mod config;
pub mod error;
pub mod input;
pub mod markup;
pub mod monitor;
pub mod pusher;
pub mod rate;
pub mod sanitize;
pub mod state;
pub mod status;
pub mod telegram;
pub mod tmux;
pub mod topic;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
