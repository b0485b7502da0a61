use super::{TtsEngine, VoiceParams};
use crate::core::config::AudioConfig;
use crate::utils::audio::AudioBuffer;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use tokio::time::{sleep, Duration};

/// The reference ChatTTS server runs one inference at a time.
const SERVER_CONCURRENCY: usize = 1;

/// Client for a ChatTTS HTTP server exposing `POST /generate`.
#[derive(Debug)]
pub struct ChatTtsClient {
    client: reqwest::Client,
    endpoint: String,
    retry_count: usize,
    retry_delay: Duration,
}

#[derive(Serialize, Debug)]
struct GenerateRequest<'a> {
    text: &'a str,
    voice: &'a str,
    skip_refine_text: bool,
    params_infer_code: InferCodeParams,
    params_refine_text: RefineTextParams<'a>,
}

#[derive(Serialize, Debug)]
struct InferCodeParams {
    temperature: f32,
    #[serde(rename = "top_P")]
    top_p: f32,
    #[serde(rename = "top_K")]
    top_k: u32,
    speed: f32,
}

#[derive(Serialize, Debug)]
struct RefineTextParams<'a> {
    prompt: &'a str,
}

impl<'a> GenerateRequest<'a> {
    fn new(text: &'a str, params: &'a VoiceParams) -> Self {
        Self {
            text,
            voice: &params.voice_id,
            skip_refine_text: false,
            params_infer_code: InferCodeParams {
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                speed: params.speed,
            },
            params_refine_text: RefineTextParams {
                prompt: &params.prompt,
            },
        }
    }
}

impl ChatTtsClient {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint: format!("{}/generate", config.base_url.trim_end_matches('/')),
            retry_count: config.retry_count,
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
        })
    }

    async fn try_generate(&self, request: &GenerateRequest<'_>) -> Result<AudioBuffer> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .context("Failed to send ChatTTS request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ChatTTS returned {}: {}", status, body));
        }

        let bytes = resp.bytes().await.context("Failed to read ChatTTS response")?;
        AudioBuffer::from_wav_bytes(&bytes)
    }
}

#[async_trait]
impl TtsEngine for ChatTtsClient {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioBuffer> {
        let request = GenerateRequest::new(text, params);
        let attempts = self.retry_count + 1;
        let mut last_error = anyhow!("Unknown error");

        for attempt in 0..attempts {
            if attempt > 0 {
                warn!(
                    "ChatTTS generation failed (attempt {}/{}), retrying...",
                    attempt, attempts
                );
                sleep(self.retry_delay).await;
            }

            debug!("ChatTTS request: voice={} prompt={}", params.voice_id, params.prompt);
            match self.try_generate(&request).await {
                Ok(audio) if audio.sample_rate != self.sample_rate() => {
                    return Err(anyhow!(
                        "ChatTTS returned {} Hz audio, expected {} Hz",
                        audio.sample_rate,
                        self.sample_rate()
                    ));
                }
                Ok(audio) => return Ok(audio),
                Err(e) => {
                    warn!("ChatTTS error: {:#}", e);
                    last_error = e;
                }
            }
        }

        Err(last_error.context(format!("ChatTTS generation failed after {} attempts", attempts)))
    }

    fn max_concurrency(&self) -> usize {
        SERVER_CONCURRENCY
    }
}
