//! Model response protocol: prompt assembly, the strict-JSON decision
//! contract, salvage parsing, and the bounded retry loop around the backend.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use regex_lite::Regex;
use serde_json::Value;
use tokio::time::sleep;

use crate::buffer::BufferedMessage;
use crate::llm::ModelBackend;
use crate::usage::TokenUsage;

/// What the model decided to do with the current chat state. `text` is
/// present and non-empty exactly when `should_reply` is true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDecision {
    pub should_reply: bool,
    pub text: Option<String>,
}

impl ModelDecision {
    pub fn silent() -> Self {
        Self {
            should_reply: false,
            text: None,
        }
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            should_reply: true,
            text: Some(text.into()),
        }
    }
}

// ─── Prompt assembly ─────────────────────────────────────────────────────────

/// Render the buffered history plus directives into the user-content channel.
/// The persona instruction travels separately as the system instruction.
pub fn build_user_prompt(
    messages: &[BufferedMessage],
    mandatory: bool,
    now: DateTime<FixedOffset>,
) -> String {
    let lines: Vec<String> = messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let reply_tag = message
                .reply_to
                .as_deref()
                .map(|name| format!(" [reply to {}]", name))
                .unwrap_or_default();
            let latest_tag = if index == messages.len() - 1 {
                " (latest)"
            } else {
                ""
            };
            format!(
                "{}{}{}: {}",
                message.sender, reply_tag, latest_tag, message.text
            )
        })
        .collect();

    format!(
        "Now: {}\nmandatory: {}\n\nRecent chat messages:\n{}",
        now.format("%-d %B %Y, %H:%M"),
        mandatory,
        lines.join("\n")
    )
}

// ─── Decision parsing ────────────────────────────────────────────────────────

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    match rest.strip_suffix("```") {
        Some(inner) => inner.trim(),
        None => trimmed,
    }
}

/// Second-chance decoder for near-JSON model output: pull the first
/// `"text": "..."` payload out of text the strict parser rejected. Runs only
/// after a genuine JSON syntax failure, never on mere shape violations.
fn salvage_text(raw: &str) -> Option<String> {
    static TEXT_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = TEXT_PATTERN
        .get_or_init(|| Regex::new(r#""text"\s*:\s*"([^"]+)""#).ok())
        .as_ref()?;
    pattern
        .captures(raw)
        .map(|captures| captures[1].trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Turn raw model output into a decision. Shape violations degrade to
/// silence; only outright JSON failures get the salvage pass. Never errors.
pub fn parse_decision(raw: &str) -> ModelDecision {
    let cleaned = strip_code_fences(raw);

    match serde_json::from_str::<Value>(cleaned) {
        Ok(value) => match value.get("reply").and_then(Value::as_bool) {
            Some(true) => match value.get("text").and_then(Value::as_str).map(str::trim) {
                Some(text) if !text.is_empty() => ModelDecision::reply(text),
                _ => ModelDecision::silent(),
            },
            Some(false) => ModelDecision::silent(),
            None => {
                tracing::warn!("Model returned JSON without a boolean 'reply' field: {}", raw);
                ModelDecision::silent()
            }
        },
        Err(_) => match salvage_text(raw) {
            Some(text) => {
                tracing::info!("Salvaged reply text from malformed model output");
                ModelDecision::reply(text)
            }
            None => {
                tracing::warn!("Could not parse model output, staying silent: {}", raw);
                ModelDecision::silent()
            }
        },
    }
}

// ─── Response engine ─────────────────────────────────────────────────────────

pub struct ResponseEngine {
    backend: Arc<dyn ModelBackend>,
    system_prompt: String,
    max_attempts: u32,
    retry_delay: Duration,
    clock_offset: FixedOffset,
    usage_tx: flume::Sender<TokenUsage>,
}

impl ResponseEngine {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        system_prompt: String,
        max_attempts: u32,
        retry_delay: Duration,
        clock_offset: FixedOffset,
        usage_tx: flume::Sender<TokenUsage>,
    ) -> Self {
        Self {
            backend,
            system_prompt,
            max_attempts: max_attempts.max(1),
            retry_delay,
            clock_offset,
            usage_tx,
        }
    }

    /// Ask the model what to do with the current chat state. Backend failures
    /// are retried with a fixed delay; exhaustion degrades to silence. This
    /// never returns an error; silence is always the safe default.
    pub async fn ask(&self, history: &[BufferedMessage], mandatory: bool) -> ModelDecision {
        let now = Utc::now().with_timezone(&self.clock_offset);
        let prompt = build_user_prompt(history, mandatory, now);
        tracing::debug!("Model context:\n{}\n---", prompt);

        for attempt in 1..=self.max_attempts {
            match self.backend.generate(&self.system_prompt, &prompt).await {
                Ok(output) => {
                    if let Some(usage) = output.usage {
                        let _ = self.usage_tx.send(usage);
                    }
                    tracing::debug!("Raw model output: {}", output.text);
                    return parse_decision(&output.text);
                }
                Err(e) => {
                    tracing::warn!(
                        "Model call failed (attempt {}/{}): {:#}",
                        attempt,
                        self.max_attempts,
                        e
                    );
                    if attempt < self.max_attempts {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }

        tracing::error!("Model retries exhausted, staying silent");
        ModelDecision::silent()
    }
}
