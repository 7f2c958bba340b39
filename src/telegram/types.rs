//! Telegram Bot API data types

use serde::{Deserialize, Serialize};

use crate::transport::{ChatId, InboundMessage};

/// Envelope around every Bot API response
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(default = "Option::default")]
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
    /// Bot API error code, which may differ from the HTTP status
    #[serde(default)]
    pub error_code: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// Body of a `sendMessage` call
#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest<'a> {
    pub chat_id: i64,
    pub text: &'a str,
}

impl From<Update> for InboundMessage {
    /// Updates without a message (edits, callbacks) keep their id so the
    /// cursor moves past them, but carry no chat or text.
    fn from(update: Update) -> Self {
        match update.message {
            Some(message) => InboundMessage {
                update_id: update.update_id,
                chat_id: ChatId(message.chat.id),
                text: message.text,
            },
            None => InboundMessage {
                update_id: update.update_id,
                chat_id: ChatId(0),
                text: None,
            },
        }
    }
}
