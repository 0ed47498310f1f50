//! Telegram bot gateway: best-effort alert sink plus the chat-id discovery
//! polling loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;

use super::AlertSink;
use crate::error::Error;

/// Per-request deadline for sink deliveries.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Long-poll window for `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub username: Option<String>,
}

pub struct TelegramService {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramService {
    pub fn new(bot_token: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("telegram client: {}", e)))?;
        Ok(Self {
            client,
            api_base: format!("https://api.telegram.org/bot{}", bot_token),
        })
    }

    /// Send a plain-text message to a chat.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), Error> {
        let response = self
            .client
            .post(format!("{}/sendMessage", self.api_base))
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("telegram send: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "telegram send rejected: {}",
                response.status()
            )));
        }
        debug!("[telegram] message sent to chat {}", chat_id);
        Ok(())
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<TelegramUpdate>, Error> {
        let response = self
            .client
            .get(format!("{}/getUpdates", self.api_base))
            .query(&[
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
                ("offset", offset.to_string()),
            ])
            // The request itself must outlive the long-poll window.
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("telegram poll: {}", e)))?;

        let body: UpdatesResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("telegram poll body: {}", e)))?;

        if !body.ok {
            return Err(Error::Transport("telegram poll returned ok=false".to_string()));
        }
        Ok(body.result)
    }

    /// Long-poll loop: reply to any inbound message with the sender's chat
    /// id so it can be pasted into the shop configuration. Runs until the
    /// shutdown signal flips.
    pub async fn run_polling(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("[telegram] polling started");
        let mut offset: i64 = 0;

        loop {
            let updates = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.get_updates(offset) => match result {
                    Ok(updates) => updates,
                    Err(e) => {
                        warn!("[telegram] polling error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                },
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(message) = update.message else {
                    continue;
                };
                let chat_id = message.chat.id.to_string();
                let reply = chat_id_reply(
                    &chat_id,
                    message.from.and_then(|u| u.username).as_deref(),
                );
                if let Err(e) = self.send_message(&chat_id, &reply).await {
                    warn!("[telegram] chat-id reply failed: {}", e);
                }
            }
        }

        info!("[telegram] polling stopped");
    }
}

#[async_trait]
impl AlertSink for TelegramService {
    async fn deliver(&self, target: &str, summary: &str) -> Result<(), Error> {
        self.send_message(target, summary).await
    }
}

fn chat_id_reply(chat_id: &str, username: Option<&str>) -> String {
    let greeting = match username {
        Some(name) => format!("Hello @{}!", name),
        None => "Hello!".to_string(),
    };
    format!(
        "{}\n\nYour chat id is: {}\n\nPaste it into your shop's alert settings to receive anomaly notifications here.",
        greeting, chat_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_reply_includes_id_and_username() {
        let reply = chat_id_reply("12345", Some("alice"));
        assert!(reply.contains("@alice"));
        assert!(reply.contains("12345"));

        let anonymous = chat_id_reply("67890", None);
        assert!(anonymous.starts_with("Hello!"));
        assert!(anonymous.contains("67890"));
    }

    #[test]
    fn updates_response_parses_partial_payloads() {
        let raw = r#"{
            "ok": true,
            "result": [
                {"update_id": 7, "message": {"chat": {"id": 99}, "from": {"username": "bob"}}},
                {"update_id": 8}
            ]
        }"#;
        let parsed: UpdatesResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.ok);
        assert_eq!(parsed.result.len(), 2);
        assert_eq!(parsed.result[0].message.as_ref().unwrap().chat.id, 99);
        assert!(parsed.result[1].message.is_none());
    }
}
