use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::llm::LlmConfig;
use crate::services::roles::RolesConfig;
use crate::services::script::SegmentsConfig;

const CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_novel_path")]
    pub novel_path: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default = "default_roles_path")]
    pub roles_path: String,

    #[serde(default = "default_segments_path")]
    pub segments_path: String,

    #[serde(default = "default_output_audio")]
    pub output_audio: String,

    /// Maximum chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub roles: RolesConfig,

    #[serde(default)]
    pub segments: SegmentsConfig,

    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String,
    #[serde(default = "default_tts_base_url")]
    pub base_url: String,
    pub narrator_voice: Option<String>,
    /// Overrides the engine's own concurrency limit when set.
    pub concurrency: Option<usize>,
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default)]
    pub simplify_chinese: bool,
    #[serde(default = "default_temp_folder")]
    pub temp_folder: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            base_url: default_tts_base_url(),
            narrator_voice: None,
            concurrency: None,
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay(),
            simplify_chinese: false,
            temp_folder: default_temp_folder(),
        }
    }
}

fn default_novel_path() -> String {
    "novel.txt".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_roles_path() -> String {
    "build/novel_roles.json".to_string()
}
fn default_segments_path() -> String {
    "build/novel_processed.json".to_string()
}
fn default_output_audio() -> String {
    "output/novel_voice.wav".to_string()
}
fn default_chunk_size() -> usize {
    2000
}
fn default_tts_provider() -> String {
    "chattts".to_string()
}
fn default_tts_base_url() -> String {
    "http://127.0.0.1:9966".to_string()
}
fn default_retry_count() -> usize {
    2
}
fn default_retry_delay() -> u64 {
    2
}
fn default_temp_folder() -> String {
    "build/temp_audio_segments".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(CONFIG_PATH, content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.build_folder)?;
        for file in [&self.roles_path, &self.segments_path, &self.output_audio] {
            if let Some(parent) = Path::new(file).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(())
    }
}
