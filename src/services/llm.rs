use crate::core::config::Config;
use crate::core::error::PipelineError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use url::Url;

const DASHSCOPE_BASE_URL: &str = "https://dashscope.aliyuncs.com";
const DASHSCOPE_GENERATION_PATH: &str = "api/v1/services/aigc/text-generation/generation";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, prompt: &str) -> Result<String>;
}

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmProvider {
    #[default]
    #[serde(rename = "dashscope")]
    DashScope,
    #[serde(rename = "openai")]
    OpenAI,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub enum ModelName {
    #[default]
    #[serde(rename = "qwen-turbo")]
    QwenTurbo,
    #[serde(rename = "qwen-plus")]
    QwenPlus,
    #[serde(rename = "qwen-max")]
    QwenMax,
    #[serde(untagged)]
    Custom(String),
}

impl ModelName {
    pub const KNOWN: [ModelName; 3] = [ModelName::QwenTurbo, ModelName::QwenPlus, ModelName::QwenMax];

    pub fn as_str(&self) -> &str {
        match self {
            ModelName::QwenTurbo => "qwen-turbo",
            ModelName::QwenPlus => "qwen-plus",
            ModelName::QwenMax => "qwen-max",
            ModelName::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    #[default]
    Text,
    Message,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: ModelName,
    pub base_url: Option<String>,
    #[serde(default)]
    pub result_format: ResultFormat,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_skipped_log")]
    pub skipped_log: String,
    #[serde(default)]
    pub moderation: ModerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModerationConfig {
    #[serde(default = "default_moderation_codes")]
    pub codes: Vec<String>,
    #[serde(default = "default_moderation_substrings")]
    pub substrings: Vec<String>,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            codes: default_moderation_codes(),
            substrings: default_moderation_substrings(),
        }
    }
}

fn default_temperature() -> f32 {
    0.1
}
fn default_timeout() -> u64 {
    30
}
fn default_concurrency() -> usize {
    1
}
fn default_skipped_log() -> String {
    "build/skipped_chunks.log".to_string()
}
fn default_moderation_codes() -> Vec<String> {
    vec![
        "DataInspectionFailed".to_string(),
        "data_inspection_failed".to_string(),
    ]
}
fn default_moderation_substrings() -> Vec<String> {
    vec!["inappropriate content".to_string()]
}

// --- Moderation ---

/// Recognises provider rejections caused by content moderation, so the
/// offending chunk can be skipped instead of aborting the stage.
#[derive(Debug, Clone)]
pub struct ModerationFilter {
    codes: Vec<String>,
    substrings: Vec<String>,
}

impl ModerationFilter {
    pub fn new(config: &ModerationConfig) -> Self {
        Self {
            codes: config.codes.clone(),
            substrings: config
                .substrings
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    pub fn is_rejection(&self, err: &anyhow::Error) -> bool {
        match PipelineError::find(err) {
            Some(PipelineError::CallFailure { code, message, .. }) => {
                let code_match = code
                    .as_ref()
                    .is_some_and(|c| self.codes.iter().any(|known| known == c));
                let message = message.to_lowercase();
                code_match || self.substrings.iter().any(|s| message.contains(s.as_str()))
            }
            _ => false,
        }
    }
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    let cfg = &config.llm;
    if cfg.api_key.trim().is_empty() {
        return Err(anyhow!("LLM api_key is missing"));
    }
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_seconds))
        .build()?;

    match cfg.provider {
        LlmProvider::DashScope => Ok(Box::new(DashScopeClient::new(cfg, client)?)),
        LlmProvider::OpenAI => Ok(Box::new(OpenAIClient::new(cfg, client))),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}

fn transport_error(e: reqwest::Error) -> PipelineError {
    PipelineError::CallFailure {
        status: e.status().map(|s| s.as_u16()),
        code: None,
        message: e.to_string(),
    }
}

// --- DashScope ---

#[derive(Debug)]
struct DashScopeClient {
    api_key: String,
    model: String,
    endpoint: Url,
    result_format: ResultFormat,
    temperature: f32,
    client: reqwest::Client,
}

impl DashScopeClient {
    fn new(cfg: &LlmConfig, client: reqwest::Client) -> Result<Self> {
        let base = cfg.base_url.as_deref().unwrap_or(DASHSCOPE_BASE_URL);
        let endpoint = Url::parse(&format!("{}/", base.trim_end_matches('/')))?
            .join(DASHSCOPE_GENERATION_PATH)?;
        Ok(Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.as_str().to_string(),
            endpoint,
            result_format: cfg.result_format,
            temperature: cfg.temperature,
            client,
        })
    }
}

#[derive(Serialize)]
struct DashScopeRequest<'a> {
    model: &'a str,
    input: DashScopeInput<'a>,
    parameters: DashScopeParameters,
}

#[derive(Serialize)]
struct DashScopeInput<'a> {
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct DashScopeParameters {
    result_format: ResultFormat,
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct DashScopeResponse {
    output: Option<DashScopeOutput>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct DashScopeOutput {
    text: Option<String>,
    #[serde(default)]
    choices: Vec<DashScopeChoice>,
}

#[derive(Deserialize, Debug)]
struct DashScopeChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    content: Option<String>,
}

impl DashScopeResponse {
    /// `output.text` for the text format, `output.choices[0].message.content`
    /// for the message format. Both are tried.
    fn answer(self) -> Option<String> {
        let output = self.output?;
        if let Some(text) = output.text.filter(|t| !t.is_empty()) {
            return Some(text);
        }
        output
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
    }
}

#[derive(Deserialize)]
struct DashScopeErrorBody {
    code: Option<String>,
    message: Option<String>,
}

fn dashscope_status_error(status: u16, body: &str) -> PipelineError {
    match serde_json::from_str::<DashScopeErrorBody>(body) {
        Ok(err) => PipelineError::CallFailure {
            status: Some(status),
            code: err.code,
            message: err.message.unwrap_or_else(|| truncate(body, 200)),
        },
        Err(_) => PipelineError::CallFailure {
            status: Some(status),
            code: None,
            message: truncate(body, 200),
        },
    }
}

fn parse_dashscope_body(body: &str) -> Result<String, PipelineError> {
    let response: DashScopeResponse = serde_json::from_str(body).map_err(|e| {
        PipelineError::call_failure(format!(
            "response body is not valid JSON: {}. Body: {}",
            e,
            truncate(body, 200)
        ))
    })?;

    let code = response.code.clone();
    let message = response.message.clone();
    response.answer().ok_or_else(|| PipelineError::CallFailure {
        status: None,
        code,
        message: message.unwrap_or_else(|| {
            format!("cannot extract content from response: {}", truncate(body, 200))
        }),
    })
}

#[async_trait]
impl LlmClient for DashScopeClient {
    async fn chat(&self, prompt: &str) -> Result<String> {
        let request_body = DashScopeRequest {
            model: &self.model,
            input: DashScopeInput {
                messages: vec![ChatMessage {
                    role: "user",
                    content: prompt,
                }],
            },
            parameters: DashScopeParameters {
                result_format: self.result_format,
                temperature: self.temperature,
            },
        };

        debug!("DashScope request: model={}, prompt {} chars", self.model, prompt.chars().count());

        let resp = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(dashscope_status_error(status.as_u16(), &body).into());
        }

        Ok(parse_dashscope_body(&body)?)
    }
}

// --- OpenAI-compatible ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(cfg: &LlmConfig, client: reqwest::Client) -> Self {
        Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.as_str().to_string(),
            base_url: cfg
                .base_url
                .as_deref()
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            temperature: cfg.temperature,
            client,
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct OpenAIErrorEnvelope {
    error: OpenAIError,
}

#[derive(Deserialize)]
struct OpenAIError {
    code: Option<String>,
    message: String,
}

fn openai_status_error(status: u16, body: &str) -> PipelineError {
    match serde_json::from_str::<OpenAIErrorEnvelope>(body) {
        Ok(env) => PipelineError::CallFailure {
            status: Some(status),
            code: env.error.code,
            message: env.error.message,
        },
        Err(_) => PipelineError::CallFailure {
            status: Some(status),
            code: None,
            message: truncate(body, 200),
        },
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(openai_status_error(status.as_u16(), &body).into());
        }

        let result: OpenAIResponse = serde_json::from_str(&body).map_err(|e| {
            PipelineError::call_failure(format!("Failed to parse OpenAI response: {}", e))
        })?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PipelineError::call_failure("OpenAI response empty or missing content").into())
    }
}
