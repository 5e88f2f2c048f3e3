//! Language-model backend: the `ModelBackend` seam plus the Gemini
//! `generateContent` implementation behind it.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::usage::TokenUsage;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Clone, Default)]
pub struct GenerateOutput {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// One round trip to a language model: system instruction + user content in,
/// raw text out. Fails on transport or server errors; never interprets the
/// text itself.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(&self, system_instruction: &str, user_content: &str)
        -> Result<GenerateOutput>;
}

pub struct GeminiBackend {
    client: Client,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    request_timeout: Duration,
}

impl GeminiBackend {
    pub fn new(
        api_key: String,
        model: String,
        temperature: f32,
        max_output_tokens: u32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            temperature,
            max_output_tokens,
            request_timeout,
        }
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "systemInstruction")]
    system_instruction: Content<'a>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: &'static str,
    #[serde(rename = "thinkingConfig")]
    thinking_config: ThinkingConfig,
}

#[derive(Serialize)]
struct ThinkingConfig {
    #[serde(rename = "thinkingBudget")]
    thinking_budget: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<CandidatePart>>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "thoughtsTokenCount")]
    thoughts_token_count: Option<u64>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

// ─── Implementation ──────────────────────────────────────────────────────────

fn output_from_response(response: GenerateResponse) -> Result<GenerateOutput> {
    if let Some(error) = response.error {
        anyhow::bail!("Gemini error: {}", error.message);
    }

    let mut text = String::new();
    if let Some(candidate) = response.candidates.and_then(|c| c.into_iter().next()) {
        if let Some(parts) = candidate.content.and_then(|c| c.parts) {
            for part in parts {
                if let Some(t) = part.text {
                    text.push_str(&t);
                }
            }
        }
    }

    let usage = response.usage_metadata.map(|u| TokenUsage {
        input: u.prompt_token_count.unwrap_or(0),
        output: u.candidates_token_count.unwrap_or(0),
        thinking: u.thoughts_token_count.unwrap_or(0),
    });

    Ok(GenerateOutput { text, usage })
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    async fn generate(
        &self,
        system_instruction: &str,
        user_content: &str,
    ) -> Result<GenerateOutput> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![TextPart { text: user_content }],
            }],
            system_instruction: Content {
                parts: vec![TextPart {
                    text: system_instruction,
                }],
            },
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
                response_mime_type: "application/json",
                thinking_config: ThinkingConfig { thinking_budget: 0 },
            },
        };

        let url = format!(
            "{}/{}:generateContent?key={}",
            GEMINI_API_BASE, self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to send Gemini request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error {}: {}", status, body);
        }

        let api_response: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Gemini response")?;

        output_from_response(api_response)
    }
}
