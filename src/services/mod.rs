pub mod chunker;
pub mod llm;
pub mod roles;
pub mod script;
pub mod setup;
pub mod synthesizer;
pub mod tts;
pub mod voice_map;
pub mod workflow;
