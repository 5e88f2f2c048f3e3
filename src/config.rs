use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

/// Default persona instruction. Swappable via the config file; the engine
/// never depends on its wording, only on the JSON output contract it states.
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are Gaffer, a fictional character in a group chat: a wise, dryly ironic old man. \
You are not a real person and say so if asked, but you talk like one. The people in the chat are real.\n\
Talk about anything (no politics, no wars). Keep it short, under 30 words. \
Answer the point with specifics. Do not introduce yourself, do not address people by name, \
do not use pet names.\n\
If someone insults you, needle them back with humor.\n\
Every message in the chat history is signed with its author's name. A [reply to X] tag means \
that person is answering X specifically. Do not mix people up and do not repeat yourself. \
The history is background. Answer the latest message only.\n\
mandatory=true means you answer. mandatory=false means answer only if you have something \
worth saying, otherwise {\"reply\": false}.\n\
Output strictly one JSON object: {\"reply\": false} or {\"reply\": true, \"text\": \"...\"}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // Persona
    #[serde(default = "default_bot_display_name")]
    pub bot_display_name: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Name variants the persona answers to (case-insensitive substring match).
    #[serde(default = "default_address_keywords")]
    pub address_keywords: Vec<String>,
    /// Public chat usernames the bot will stay in. Empty list disables the
    /// allow-list; any other group gets left on first contact.
    #[serde(default)]
    pub allowed_chat_usernames: Vec<String>,

    // Context buffer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_max_message_age_secs")]
    pub max_message_age_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    // Reply policy
    #[serde(default = "default_reply_probability")]
    pub reply_probability: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    // Model
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// UTC offset (hours) for the date-time line in the prompt.
    #[serde(default = "default_prompt_utc_offset_hours")]
    pub prompt_utc_offset_hours: i32,

    // Delivery pacing
    #[serde(default = "default_reply_delay_min_ms")]
    pub reply_delay_min_ms: u64,
    #[serde(default = "default_reply_delay_max_ms")]
    pub reply_delay_max_ms: u64,
    #[serde(default = "default_typing_refresh_secs")]
    pub typing_refresh_secs: u64,

    // Usage accounting
    #[serde(default = "default_usage_report_interval_secs")]
    pub usage_report_interval_secs: u64,
}

fn default_bot_display_name() -> String {
    "Gaffer".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_address_keywords() -> Vec<String> {
    ["gaffer", "grandpa", "gramps", "granddad", "old man"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_buffer_capacity() -> usize {
    30
}

fn default_max_message_age_secs() -> u64 {
    2 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    10 * 60
}

fn default_reply_probability() -> f64 {
    0.3
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_model() -> String {
    "gemini-2.5-flash-lite".to_string()
}

fn default_temperature() -> f32 {
    1.5
}

fn default_max_output_tokens() -> u32 {
    512
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    3
}

fn default_prompt_utc_offset_hours() -> i32 {
    3
}

fn default_reply_delay_min_ms() -> u64 {
    3_000
}

fn default_reply_delay_max_ms() -> u64 {
    6_000
}

fn default_typing_refresh_secs() -> u64 {
    4
}

fn default_usage_report_interval_secs() -> u64 {
    24 * 60 * 60
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_display_name: default_bot_display_name(),
            system_prompt: default_system_prompt(),
            address_keywords: default_address_keywords(),
            allowed_chat_usernames: Vec::new(),
            buffer_capacity: default_buffer_capacity(),
            max_message_age_secs: default_max_message_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            reply_probability: default_reply_probability(),
            cooldown_secs: default_cooldown_secs(),
            model: default_model(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            prompt_utc_offset_hours: default_prompt_utc_offset_hours(),
            reply_delay_min_ms: default_reply_delay_min_ms(),
            reply_delay_max_ms: default_reply_delay_max_ms(),
            typing_refresh_secs: default_typing_refresh_secs(),
            usage_report_interval_secs: default_usage_report_interval_secs(),
        }
    }
}

impl BotConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("gaffer_config.toml")
    }

    /// Load config from gaffer_config.toml (next to executable), falling back
    /// to defaults. Env vars win either way.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config.with_env_overrides()
            }
            Err(e) => {
                tracing::warn!(
                    "No usable config at {:?} ({:#}), using defaults + env vars",
                    path,
                    e
                );
                Self::default().with_env_overrides()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(name) = env::var("GAFFER_BOT_NAME") {
            if !name.trim().is_empty() {
                self.bot_display_name = name;
            }
        }

        if let Ok(model) = env::var("GEMINI_MODEL") {
            if !model.trim().is_empty() {
                self.model = model;
            }
        }

        if let Ok(probability) = env::var("GAFFER_REPLY_PROBABILITY") {
            if let Ok(value) = probability.parse() {
                self.reply_probability = value;
            }
        }

        if let Ok(cooldown) = env::var("GAFFER_COOLDOWN_SECS") {
            if let Ok(seconds) = cooldown.parse() {
                self.cooldown_secs = seconds;
            }
        }

        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_message_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_message_age_secs as i64)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn usage_report_period(&self) -> Duration {
        Duration::from_secs(self.usage_report_interval_secs)
    }

    pub fn prompt_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.prompt_utc_offset_hours.clamp(-23, 23) * 3600)
            .unwrap_or_else(|| Utc.fix())
    }
}
