use crate::core::config::Config;
use crate::core::state::Emotion;
use crate::utils::audio::AudioBuffer;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;

/// Output rate of the ChatTTS family of models.
pub const SAMPLE_RATE: u32 = 24000;

/// Everything the engine needs besides the text itself.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParams {
    pub voice_id: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub speed: f32,
    /// Refine-text prompt, e.g. `[happy]`.
    pub prompt: String,
}

impl VoiceParams {
    pub fn for_emotion(emotion: Emotion, voice_id: impl Into<String>, speed: f32) -> Self {
        let (temperature, top_p, top_k) = emotion_params(emotion);
        Self {
            voice_id: voice_id.into(),
            temperature,
            top_p,
            top_k,
            speed,
            prompt: format!("[{}]", emotion),
        }
    }
}

/// Sampling parameters (temperature, top_p, top_k) per emotion.
pub fn emotion_params(emotion: Emotion) -> (f32, f32, u32) {
    match emotion {
        Emotion::Neutral => (0.3, 0.7, 20),
        Emotion::Happy => (0.7, 0.8, 15),
        Emotion::Sad => (0.2, 0.6, 25),
        Emotion::Angry => (0.8, 0.9, 10),
        Emotion::Calm => (0.1, 0.5, 30),
        Emotion::Surprised => (0.9, 0.85, 12),
    }
}

#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioBuffer>;

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn max_concurrency(&self) -> usize {
        1
    }
}

pub fn create_tts_engine(config: &Config) -> Result<Box<dyn TtsEngine>> {
    info!("Initializing TTS engine for provider: {}", config.audio.provider);
    match config.audio.provider.as_str() {
        "chattts" => Ok(Box::new(chattts::ChatTtsClient::new(&config.audio)?)),
        _ => Err(anyhow!("Unknown TTS provider: {}", config.audio.provider)),
    }
}

pub mod chattts;
