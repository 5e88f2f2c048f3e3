//! Telegram transport binding.
//!
//! Long-polls `getUpdates` and hands every inbound message to the group-chat
//! handler in its own task. Outbound operations live behind the
//! `ChatTransport` trait so the handler can be exercised against a stub.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::handler::GroupChatHandler;

/// Telegram enforces a 4096-character limit per message.
const MAX_MESSAGE_LEN: usize = 4096;
const POLL_TIMEOUT_SECS: u64 = 30;

// ─── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    pub reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
    #[serde(other)]
    Other,
}

impl ChatKind {
    /// The bot only converses in multi-party chats.
    pub fn is_multi_party(self) -> bool {
        matches!(self, ChatKind::Group | ChatKind::Supergroup)
    }
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: i64,
    pub username: String,
}

// ─── Outbound operations ─────────────────────────────────────────────────────

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<()>;
    async fn send_typing(&self, chat_id: i64) -> Result<()>;
    async fn leave_chat(&self, chat_id: i64) -> Result<()>;
}

pub struct TelegramApi {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramApi {
    pub fn new(token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: format!("https://api.telegram.org/bot{}", token),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let url = format!("{}/{}", self.api_base, method);
        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .with_context(|| format!("Telegram {} request failed", method))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram {} returned HTTP {}: {}", method, status, body);
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .with_context(|| format!("Telegram {} response parse failed", method))?;

        if !envelope.ok {
            anyhow::bail!(
                "Telegram {} returned ok=false: {}",
                method,
                envelope.description.unwrap_or_default()
            );
        }

        envelope
            .result
            .with_context(|| format!("Telegram {} response missing result", method))
    }

    pub async fn get_me(&self) -> Result<BotIdentity> {
        let me: User = self.call("getMe", json!({})).await?;
        Ok(BotIdentity {
            id: me.id,
            username: me.username.unwrap_or_default(),
        })
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"]
            }),
        )
        .await
    }
}

#[async_trait]
impl ChatTransport for TelegramApi {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<()> {
        let mut params = json!({
            "chat_id": chat_id,
            "text": truncate_for_telegram(text),
        });
        if let Some(message_id) = reply_to_message_id {
            params["reply_to_message_id"] = json!(message_id);
        }
        let _: serde_json::Value = self.call("sendMessage", params).await?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "sendChatAction",
                json!({ "chat_id": chat_id, "action": "typing" }),
            )
            .await?;
        Ok(())
    }

    async fn leave_chat(&self, chat_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call("leaveChat", json!({ "chat_id": chat_id }))
            .await?;
        Ok(())
    }
}

/// Clamp outbound text to the Telegram limit without splitting a character.
pub fn truncate_for_telegram(text: &str) -> &str {
    if text.len() <= MAX_MESSAGE_LEN {
        return text;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ─── Long-poll loop ──────────────────────────────────────────────────────────

/// Poll for updates forever, spawning one handler task per inbound message.
/// Transient API failures back off and keep polling.
pub async fn run_polling(api: Arc<TelegramApi>, handler: Arc<GroupChatHandler>) {
    let mut offset: i64 = 0;

    loop {
        let updates = match api.get_updates(offset).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!("getUpdates failed: {:#}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);

            let Some(message) = update.message else {
                continue;
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler.handle(message).await;
            });
        }
    }
}
