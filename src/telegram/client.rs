//! Telegram Bot API client

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::{ApiResponse, SendMessageRequest, Update};
use crate::config::TelegramConfig;
use crate::transport::{ChatId, ChatTransport, InboundMessage, TransportError};

/// Long-polling Bot API client
pub struct TelegramClient {
    endpoint: String,
    client: reqwest::Client,
    poll_timeout_secs: u64,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            endpoint: format!(
                "{}/bot{}",
                config.api_url.trim_end_matches('/'),
                config.token
            ),
            client,
            poll_timeout_secs: config.poll_timeout_secs,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.endpoint, method)
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let parsed: Result<ApiResponse<T>, _> = serde_json::from_str(&body);
        match parsed {
            Ok(envelope) if envelope.ok && status.is_success() => envelope
                .result
                .ok_or_else(|| TransportError::Decode("response has no result".to_string())),
            Ok(envelope) => {
                let code = envelope.error_code.unwrap_or(status.as_u16());
                let description = envelope
                    .description
                    .unwrap_or_else(|| status.to_string());
                if code == 429 || (500..600).contains(&code) {
                    Err(TransportError::Status(code, description))
                } else {
                    Err(TransportError::Api(description))
                }
            }
            Err(_) if !status.is_success() => Err(TransportError::Status(status.as_u16(), body)),
            Err(e) => Err(TransportError::Decode(e.to_string())),
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn fetch_updates(
        &self,
        cursor: Option<i64>,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let mut query = vec![("timeout", self.poll_timeout_secs.to_string())];
        if let Some(offset) = cursor {
            query.push(("offset", offset.to_string()));
        }

        let response = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&query)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let updates: Vec<Update> = Self::decode(response).await?;
        debug!("getUpdates returned {} updates", updates.len());
        Ok(updates.into_iter().map(InboundMessage::from).collect())
    }

    async fn send_message(&self, chat: ChatId, text: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&SendMessageRequest {
                chat_id: chat.0,
                text,
            })
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let _: serde_json::Value = Self::decode(response).await?;
        Ok(())
    }
}
