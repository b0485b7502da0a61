use anyhow::Result;
use novel2voice::core::config::Config;
use novel2voice::core::io::NativeStorage;
use novel2voice::services::llm::create_llm;
use novel2voice::services::setup;
use novel2voice::services::tts::create_tts_engine;
use novel2voice::services::workflow::PipelineManager;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    setup::run_setup(&mut config)?;

    let llm = create_llm(&config)?;
    let tts = create_tts_engine(&config)?;
    let storage = Arc::new(NativeStorage::new());

    let manager = PipelineManager::new(config, llm, tts, storage);
    if let Err(e) = manager.run().await {
        eprintln!("Pipeline failed: {:#}", e);
        return Err(e);
    }

    Ok(())
}
