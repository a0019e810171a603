// src/llm_client.rs

use crate::config::{ConfigError, LlmBackend, LlmSection};
use crate::pdf_text::{self, PdfContent};
use crate::prompts::{
    EXTRACT_SETTINGS, GenerationSettings, SYSTEM_INSTRUCTION, TEXT_EXTRACTION_PROMPT,
    TRANSCRIBE_SETTINGS,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("empty response from LLM")]
    Empty,
    #[error("PDF has no text layer: {0}")]
    NoText(String),
    #[error("backend not reachable at {0}")]
    Unreachable(String),
}

/// The two calls the intake pipeline makes against a generative model.
#[async_trait]
pub trait InvoiceModel: Send + Sync {
    /// Plain transcription of the PDF's text.
    async fn transcribe(&self, pdf_bytes: &[u8]) -> Result<String, ModelError>;

    /// Reply to the rendered invoice extraction prompt.
    async fn extract(&self, prompt: &str) -> Result<String, ModelError>;

    fn describe(&self) -> String;
}

/// Resolve the configured backend into a concrete client.
pub fn build_model(llm: &LlmSection) -> Result<Box<dyn InvoiceModel>, ConfigError> {
    build_model_with(llm, |key| std::env::var(key).ok())
}

/// As [`build_model`], reading API keys through `lookup`.
fn build_model_with(
    llm: &LlmSection,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Box<dyn InvoiceModel>, ConfigError> {
    let endpoint = llm.active();
    match llm.backend {
        LlmBackend::Gemini => {
            let api_key = lookup("GOOGLE_API_KEY")
                .ok_or(ConfigError::MissingKey("GOOGLE_API_KEY", "gemini"))?;
            info!(url = %endpoint.base_url, model = %endpoint.model, "Using Gemini backend");
            Ok(Box::new(GeminiClient::new(
                &endpoint.base_url,
                &endpoint.model,
                api_key,
            )))
        }
        LlmBackend::Ollama => {
            info!(url = %endpoint.base_url, model = %endpoint.model, "Using Ollama (local) backend");
            // required by the API but ignored
            let mut client = ChatClient::new(&endpoint.base_url, &endpoint.model, "ollama");
            client.health_check = true;
            Ok(Box::new(client))
        }
        LlmBackend::Remote => {
            let api_key = lookup("LLM_API_KEY")
                .ok_or(ConfigError::MissingKey("LLM_API_KEY", "remote"))?;
            info!(url = %endpoint.base_url, model = %endpoint.model, "Using remote API backend");
            Ok(Box::new(ChatClient::new(
                &endpoint.base_url,
                &endpoint.model,
                &api_key,
            )))
        }
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ModelError::Api { status, body })
}

// ---------------------------------------------------------------------------
// Gemini generateContent
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Part<'a> {
    Text(&'a str),
    InlineData(InlineData),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    thinking_config: ThinkingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_level: &'static str,
}

impl From<GenerationSettings> for GenerationConfig {
    fn from(s: GenerationSettings) -> Self {
        Self {
            temperature: s.temperature,
            thinking_config: ThinkingConfig {
                thinking_level: s.thinking_level,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    /// Concatenated text parts of the first candidate.
    fn text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, model: &str, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }

    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<String, ModelError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;
        let response = error_for_status(response).await?;
        let body: GenerateResponse = response.json().await?;
        body.text().ok_or(ModelError::Empty)
    }
}

#[async_trait]
impl InvoiceModel for GeminiClient {
    async fn transcribe(&self, pdf_bytes: &[u8]) -> Result<String, ModelError> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![
                    Part::InlineData(InlineData {
                        mime_type: "application/pdf",
                        data: general_purpose::STANDARD.encode(pdf_bytes),
                    }),
                    Part::Text(TEXT_EXTRACTION_PROMPT),
                ],
            }],
            system_instruction: None,
            generation_config: TRANSCRIBE_SETTINGS.into(),
        };
        self.generate(&request).await
    }

    async fn extract(&self, prompt: &str) -> Result<String, ModelError> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part::Text(prompt)],
            }],
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::Text(SYSTEM_INSTRUCTION)],
            }),
            generation_config: EXTRACT_SETTINGS.into(),
        };
        self.generate(&request).await
    }

    fn describe(&self) -> String {
        format!("gemini/{}", self.model)
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Text-only backend. Transcription uses the PDF's own text layer.
pub struct ChatClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    /// Check the server root is up before the first extraction (Ollama).
    pub health_check: bool,
    /// Set once a health check succeeds; a failed check is retried.
    reachable: AtomicBool,
}

impl ChatClient {
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            health_check: false,
            reachable: AtomicBool::new(false),
        }
    }

    async fn ensure_reachable(&self) -> Result<(), ModelError> {
        if !self.health_check || self.reachable.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.is_reachable().await {
            return Err(ModelError::Unreachable(self.base_url.clone()));
        }
        info!(url = %self.base_url, "LLM server reachable");
        self.reachable.store(true, Ordering::Release);
        Ok(())
    }

    /// Ollama's health endpoint is at the root, not under /v1.
    async fn is_reachable(&self) -> bool {
        let health_url = self.base_url.trim_end_matches("/v1");
        match self
            .client
            .get(health_url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "LLM server returned non-OK status");
                false
            }
            Err(e) => {
                warn!(error = %e, "LLM server not reachable");
                false
            }
        }
    }
}

#[async_trait]
impl InvoiceModel for ChatClient {
    async fn transcribe(&self, pdf_bytes: &[u8]) -> Result<String, ModelError> {
        match pdf_text::extract_text_from_pdf(pdf_bytes) {
            PdfContent::Text(text) => Ok(text),
            PdfContent::ScannedImage => Err(ModelError::NoText(
                "scanned document needs a document-capable backend (gemini)".to_string(),
            )),
            PdfContent::Error(e) => Err(ModelError::NoText(e)),
        }
    }

    async fn extract(&self, prompt: &str) -> Result<String, ModelError> {
        self.ensure_reachable().await?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_INSTRUCTION.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: EXTRACT_SETTINGS.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;
        let response = error_for_status(response).await?;

        let chat: ChatResponse = response.json().await?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ModelError::Empty)
    }

    fn describe(&self) -> String {
        format!("chat/{}", self.model)
    }
}
