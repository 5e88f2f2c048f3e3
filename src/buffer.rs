//! Per-chat rolling context buffer.
//!
//! Keeps the last N messages of every chat the bot can see, so the model gets
//! conversational context without any persistence. Capacity eviction happens
//! on append; age eviction happens on a periodic sweep that also forgets
//! chats whose buffers emptied, bounding memory across inactive chats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// One chat utterance as seen by the engine. Immutable once buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage {
    /// Sender display name, never empty (caller substitutes a placeholder).
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Whether this message itself demanded a reply, as evaluated on arrival.
    /// Kept for prompt annotation, never re-evaluated.
    pub mandatory: bool,
    /// Display name of the participant this message answered, if any.
    pub reply_to: Option<String>,
}

pub struct MessageBuffer {
    capacity: usize,
    max_age: chrono::Duration,
    chats: RwLock<HashMap<i64, Vec<BufferedMessage>>>,
}

impl MessageBuffer {
    pub fn new(capacity: usize, max_age: chrono::Duration) -> Self {
        Self {
            capacity,
            max_age,
            chats: RwLock::new(HashMap::new()),
        }
    }

    /// Append a message to a chat's buffer, evicting from the head once the
    /// buffer exceeds capacity. Append and eviction are one critical section.
    pub async fn append(&self, chat_id: i64, message: BufferedMessage) {
        let mut chats = self.chats.write().await;
        let buffer = chats.entry(chat_id).or_default();
        buffer.push(message);
        if buffer.len() > self.capacity {
            let excess = buffer.len() - self.capacity;
            buffer.drain(..excess);
        }
    }

    /// Ordered copy of a chat's buffer; empty for unknown chats.
    pub async fn snapshot(&self, chat_id: i64) -> Vec<BufferedMessage> {
        self.chats
            .read()
            .await
            .get(&chat_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every entry older than `max_age` as of `now`, and forget chats
    /// whose buffers emptied. Returns how many entries were removed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let max_age = self.max_age;
        let mut removed = 0;
        let mut chats = self.chats.write().await;
        chats.retain(|_, buffer| {
            let before = buffer.len();
            buffer.retain(|message| now - message.timestamp < max_age);
            removed += before - buffer.len();
            !buffer.is_empty()
        });
        removed
    }

    /// Spawn the periodic sweep. The caller owns the handle and aborts it on
    /// shutdown.
    pub fn spawn_sweep(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // interval fires immediately; skip that one
            loop {
                tick.tick().await;
                let removed = buffer.sweep_at(Utc::now()).await;
                if removed > 0 {
                    tracing::info!("Buffer sweep removed {} stale message(s)", removed);
                }
            }
        })
    }
}
