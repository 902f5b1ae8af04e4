//! Telegram Bot API client.
//!
//! A thin typed wrapper over the HTTP Bot API. The JSON models tolerate
//! unknown and missing fields; only the ids the bridge routes on are
//! required. Operations are exposed through the [`TelegramApi`] trait so the
//! send pipeline can be tested against a recording mock.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Result, TelegramError};

/// Boxed future for Telegram operations.
pub type TgFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Shared handle to a Telegram API implementation.
pub type TgHandle = Arc<dyn TelegramApi>;

/// A chat, as attached to incoming messages.
#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    /// `private`, `group`, `supergroup` or `channel`.
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Message sender.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// An incoming or sent message. Fields beyond routing ids are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    /// Present on forum-topic-closed service messages.
    #[serde(default)]
    pub forum_topic_closed: Option<serde_json::Value>,
}

/// Inline keyboard callback.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub data: Option<String>,
    /// The message the keyboard was attached to. May be absent or
    /// inaccessible for old messages.
    #[serde(default)]
    pub message: Option<Message>,
}

/// One long-poll update.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

/// Identity returned by `getMe`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotInfo {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// One button of an inline keyboard.
#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineKeyboardButton {
    #[must_use]
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Inline keyboard attached below a message.
#[derive(Debug, Clone, Serialize, Default)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

/// Parameters for `sendMessage`.
#[derive(Debug, Clone, Default)]
pub struct SendMessageParams {
    pub chat_id: i64,
    /// 0 means no thread.
    pub thread_id: i64,
    pub text: String,
    /// `HTML` or empty for plain text.
    pub parse_mode: Option<String>,
    pub reply_markup: Option<InlineKeyboardMarkup>,
    pub disable_preview: bool,
}

impl SendMessageParams {
    /// Plain text message to a chat/thread.
    #[must_use]
    pub fn text(chat_id: i64, thread_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            thread_id,
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Parameters for `editMessageText`.
#[derive(Debug, Clone, Default)]
pub struct EditMessageParams {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
    pub parse_mode: Option<String>,
    pub disable_preview: bool,
}

/// Abstraction over the Telegram Bot API.
pub trait TelegramApi: Send + Sync {
    /// Verify the token and fetch the bot identity.
    fn get_me(&self) -> TgFuture<'_, BotInfo>;
    /// Long-poll for updates after `offset`.
    fn get_updates(&self, offset: i64, timeout_secs: u64) -> TgFuture<'_, Vec<Update>>;
    /// Send a message; returns the new message id.
    fn send_message(&self, params: SendMessageParams) -> TgFuture<'_, i64>;
    /// Edit a previously sent message.
    fn edit_message_text(&self, params: EditMessageParams) -> TgFuture<'_, ()>;
    /// Send a PNG photo.
    fn send_photo(
        &self,
        chat_id: i64,
        thread_id: i64,
        png: Vec<u8>,
        reply_markup: Option<InlineKeyboardMarkup>,
    ) -> TgFuture<'_, ()>;
    /// Acknowledge a callback query (clears the client-side spinner).
    fn answer_callback_query<'a>(&'a self, callback_id: &'a str) -> TgFuture<'a, ()>;
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::Deserialize<'de>"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

/// HTTP client for the Bot API.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramClient {
    /// Create a client for `token`.
    pub fn new(token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(TelegramError::Http)?;
        Ok(Self {
            http,
            base_url: format!("https://api.telegram.org/bot{token}"),
        })
    }

    /// Point the client at a different API server (tests, local proxies).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}/{method}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(TelegramError::Http)?;

        let api: ApiResponse<T> = resp.json().await.map_err(TelegramError::Http)?;
        Self::unwrap_response(method, api)
    }

    fn unwrap_response<T>(method: &str, api: ApiResponse<T>) -> Result<T> {
        if api.ok {
            api.result.ok_or_else(|| {
                TelegramError::Decode(format!("{method}: ok response without result")).into()
            })
        } else {
            Err(TelegramError::Api {
                code: api.error_code.unwrap_or(0),
                description: api.description.unwrap_or_else(|| "unknown error".into()),
                retry_after: api.parameters.and_then(|p| p.retry_after),
            }
            .into())
        }
    }

    fn send_body(params: &SendMessageParams) -> serde_json::Value {
        let mut body = json!({
            "chat_id": params.chat_id,
            "text": params.text,
        });
        if params.thread_id != 0 {
            body["message_thread_id"] = json!(params.thread_id);
        }
        if let Some(mode) = &params.parse_mode {
            body["parse_mode"] = json!(mode);
        }
        if let Some(markup) = &params.reply_markup {
            body["reply_markup"] = serde_json::to_value(markup).unwrap_or_default();
        }
        if params.disable_preview {
            body["link_preview_options"] = json!({ "is_disabled": true });
        }
        body
    }

    fn edit_body(params: &EditMessageParams) -> serde_json::Value {
        let mut body = json!({
            "chat_id": params.chat_id,
            "message_id": params.message_id,
            "text": params.text,
        });
        if let Some(mode) = &params.parse_mode {
            body["parse_mode"] = json!(mode);
        }
        if params.disable_preview {
            body["link_preview_options"] = json!({ "is_disabled": true });
        }
        body
    }
}

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

impl TelegramApi for TelegramClient {
    fn get_me(&self) -> TgFuture<'_, BotInfo> {
        Box::pin(self.call("getMe", json!({}), CALL_TIMEOUT))
    }

    fn get_updates(&self, offset: i64, timeout_secs: u64) -> TgFuture<'_, Vec<Update>> {
        Box::pin(self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
            // The server holds the request open for `timeout_secs`.
            Duration::from_secs(timeout_secs + 15),
        ))
    }

    fn send_message(&self, params: SendMessageParams) -> TgFuture<'_, i64> {
        Box::pin(async move {
            let body = Self::send_body(&params);
            let msg: Message = self.call("sendMessage", body, CALL_TIMEOUT).await?;
            Ok(msg.message_id)
        })
    }

    fn edit_message_text(&self, params: EditMessageParams) -> TgFuture<'_, ()> {
        Box::pin(async move {
            let body = Self::edit_body(&params);
            // Result is the edited Message; we only need success.
            let _: serde_json::Value = self.call("editMessageText", body, CALL_TIMEOUT).await?;
            Ok(())
        })
    }

    fn send_photo(
        &self,
        chat_id: i64,
        thread_id: i64,
        png: Vec<u8>,
        reply_markup: Option<InlineKeyboardMarkup>,
    ) -> TgFuture<'_, ()> {
        Box::pin(async move {
            let mut form = reqwest::multipart::Form::new()
                .text("chat_id", chat_id.to_string())
                .part(
                    "photo",
                    reqwest::multipart::Part::bytes(png)
                        .file_name("screenshot.png")
                        .mime_str("image/png")
                        .map_err(TelegramError::Http)?,
                );
            if thread_id != 0 {
                form = form.text("message_thread_id", thread_id.to_string());
            }
            if let Some(markup) = &reply_markup {
                form = form.text(
                    "reply_markup",
                    serde_json::to_string(markup).unwrap_or_default(),
                );
            }

            let url = format!("{}/sendPhoto", self.base_url);
            let resp = self
                .http
                .post(&url)
                .timeout(Duration::from_secs(60))
                .multipart(form)
                .send()
                .await
                .map_err(TelegramError::Http)?;
            let api: ApiResponse<serde_json::Value> =
                resp.json().await.map_err(TelegramError::Http)?;
            Self::unwrap_response("sendPhoto", api)?;
            Ok(())
        })
    }

    fn answer_callback_query<'a>(&'a self, callback_id: &'a str) -> TgFuture<'a, ()> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .call(
                    "answerCallbackQuery",
                    json!({ "callback_query_id": callback_id }),
                    CALL_TIMEOUT,
                )
                .await?;
            Ok(())
        })
    }
}
