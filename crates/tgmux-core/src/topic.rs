//! Topic keys.
//!
//! A topic is the unit of binding: a private chat, a forum thread, or a
//! group's general channel. Keys have a stable textual form used both as map
//! keys and in the persisted state file:
//!
//! - `dm:<chat>` / `dm:<chat>:<thread>` — private chats
//! - `topic:<chat>:<thread>` — forum topic threads
//! - `general:<chat>` — group messages outside any thread

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Chat flavor, as reported by Telegram's `chat.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatKind {
    Private,
    Group,
}

/// Stable identifier for one conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TopicKey {
    kind: ChatKind,
    chat_id: i64,
    thread_id: Option<i64>,
}

impl TopicKey {
    /// Build a key from chat metadata. `thread_id` of 0 means no thread.
    #[must_use]
    pub fn new(chat_id: i64, kind: ChatKind, thread_id: Option<i64>) -> Self {
        let thread_id = thread_id.filter(|t| *t > 0);
        Self {
            kind,
            chat_id,
            thread_id,
        }
    }

    #[must_use]
    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// Thread id, 0 when the key has none (Telegram treats 0 as "no thread").
    #[must_use]
    pub fn thread_id(&self) -> i64 {
        self.thread_id.unwrap_or(0)
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        self.kind == ChatKind::Private
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.thread_id) {
            (ChatKind::Private, None) => write!(f, "dm:{}", self.chat_id),
            (ChatKind::Private, Some(t)) => write!(f, "dm:{}:{t}", self.chat_id),
            (ChatKind::Group, Some(t)) => write!(f, "topic:{}:{t}", self.chat_id),
            (ChatKind::Group, None) => write!(f, "general:{}", self.chat_id),
        }
    }
}

impl FromStr for TopicKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed topic key: {s}"))?;
        let mut parts = rest.splitn(2, ':');
        let chat_id: i64 = parts
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|_| format!("malformed chat id in topic key: {s}"))?;
        let thread_id = match parts.next() {
            Some(t) => Some(
                t.parse::<i64>()
                    .map_err(|_| format!("malformed thread id in topic key: {s}"))?,
            ),
            None => None,
        };

        match (prefix, thread_id) {
            ("dm", t) => Ok(Self::new(chat_id, ChatKind::Private, t)),
            ("topic", Some(t)) => Ok(Self::new(chat_id, ChatKind::Group, Some(t))),
            ("general", None) => Ok(Self::new(chat_id, ChatKind::Group, None)),
            _ => Err(format!("malformed topic key: {s}")),
        }
    }
}

impl From<TopicKey> for String {
    fn from(key: TopicKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for TopicKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
