use std::path::PathBuf;
use thiserror::Error;

/// Failures the pipeline distinguishes when deciding whether to skip,
/// drop or abort.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("LLM call failed (status: {status:?}, code: {code:?}): {message}")]
    CallFailure {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("Model output is not valid JSON ({reason}). Output: {output}")]
    MalformedModelOutput { reason: String, output: String },

    #[error("Model output violates the segment schema: {0}")]
    SchemaViolation(String),

    #[error("Synthesis failed for segment {index}: {message}")]
    SynthesisFailure { index: usize, message: String },

    #[error("No audio clips were produced, nothing to merge")]
    EmptyOutput,
}

impl PipelineError {
    pub fn call_failure(message: impl Into<String>) -> Self {
        PipelineError::CallFailure {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// Finds a `PipelineError` anywhere in an anyhow error chain.
    pub fn find(err: &anyhow::Error) -> Option<&PipelineError> {
        err.chain().find_map(|e| e.downcast_ref::<PipelineError>())
    }
}
