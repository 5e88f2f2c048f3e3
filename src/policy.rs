//! Reply eligibility: mandatory triggers, per-chat cooldown, probability roll.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Stateless mandatory-trigger check. A message demands a reply when it is a
/// direct reply to the persona, @-mentions its handle, or contains any of the
/// configured address keywords. All matching is case-insensitive substring.
pub fn is_mandatory(
    text: &str,
    is_reply_to_bot: bool,
    bot_username: &str,
    address_keywords: &[String],
) -> bool {
    if is_reply_to_bot {
        return true;
    }

    let lower = text.to_lowercase();

    if !bot_username.is_empty() && lower.contains(&format!("@{}", bot_username.to_lowercase())) {
        return true;
    }

    address_keywords
        .iter()
        .any(|word| lower.contains(&word.to_lowercase()))
}

/// Roll the dice on an ordinary message. Passes when a uniform draw in [0, 1)
/// lands at or below the configured probability.
pub fn passes_reply_roll(probability: f64) -> bool {
    let roll = rand::random::<f64>();
    let passed = roll <= probability;
    if !passed {
        tracing::debug!(
            "Reply roll failed ({:.0}% > {:.0}%)",
            roll * 100.0,
            probability * 100.0
        );
    }
    passed
}

/// Minimum spacing between sent replies, per chat. Stamped only when a reply
/// is actually dispatched, so a model call that ends in silence leaves it
/// untouched. Mandatory triggers never consult it.
pub struct CooldownGate {
    min_interval: Duration,
    last_reply: RwLock<HashMap<i64, Instant>>,
}

impl CooldownGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_reply: RwLock::new(HashMap::new()),
        }
    }

    pub async fn is_active(&self, chat_id: i64) -> bool {
        match self.last_reply.read().await.get(&chat_id) {
            Some(stamped_at) => stamped_at.elapsed() < self.min_interval,
            None => false,
        }
    }

    pub async fn stamp(&self, chat_id: i64) {
        self.last_reply.write().await.insert(chat_id, Instant::now());
    }
}
