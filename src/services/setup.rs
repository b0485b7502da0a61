use crate::core::config::Config;
use crate::services::llm::ModelName;
use anyhow::{anyhow, Result};
use inquire::{Password, PasswordDisplayMode, Select};
use log::info;

pub const API_KEY_ENV: &str = "DASHSCOPE_API_KEY";

/// Makes sure an LLM API key is available before the pipeline starts,
/// prompting for one (and a model) when running interactively.
pub fn run_setup(config: &mut Config) -> Result<()> {
    if apply_env_key(config, std::env::var(API_KEY_ENV).ok()) {
        return Ok(());
    }

    if config.unattended {
        return Err(anyhow!(
            "LLM api_key is not configured and {} is not set",
            API_KEY_ENV
        ));
    }

    let api_key = Password::new("Enter your LLM API key:")
        .with_display_mode(PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()?;
    if api_key.trim().is_empty() {
        return Err(anyhow!("An API key is required"));
    }
    config.llm.api_key = api_key.trim().to_string();

    let models = model_options(&config.llm.model);
    let cursor = models
        .iter()
        .position(|m| *m == config.llm.model)
        .unwrap_or(0);
    config.llm.model = Select::new("Select LLM model:", models)
        .with_starting_cursor(cursor)
        .prompt()?;

    config.save()?;
    println!("Configuration saved.");
    Ok(())
}

/// Returns true when a key is available, taking it from the environment if
/// the config has none.
fn apply_env_key(config: &mut Config, env_key: Option<String>) -> bool {
    if !config.llm.api_key.trim().is_empty() {
        return true;
    }
    match env_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => {
            info!("Using LLM API key from {}", API_KEY_ENV);
            config.llm.api_key = key.trim().to_string();
            true
        }
        None => false,
    }
}

/// The named models, plus the configured one when it is a custom name.
fn model_options(current: &ModelName) -> Vec<ModelName> {
    let mut models = ModelName::KNOWN.to_vec();
    if !models.contains(current) {
        models.push(current.clone());
    }
    models
}
