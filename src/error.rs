use std::path::PathBuf;
use thiserror::Error;

/// Document-level failures. These are the only errors that reach a caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cannot read document: {0}")]
    Parse(String),

    #[error("No narrative content found in the document")]
    NoContent,

    #[error("Text file is empty")]
    EmptyText,

    #[error("No chapters selected")]
    InvalidSelection,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audio assembly failed: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single provider call failed. Always retried, never surfaced.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Transient synthesis failure: {0}")]
    Transient(String),

    #[error("Speech engine unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Concatenation or silence generation failed.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("{0} is not installed")]
    ToolUnavailable(&'static str),

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("Nothing to concatenate into {0}")]
    NoParts(PathBuf),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Assembly worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
