use std::path::PathBuf;

use thiserror::Error;

/// Every failure category is fatal to the run: nothing is retried or
/// recovered locally.
#[derive(Debug, Error)]
pub enum TradutorError {
    #[error("failed to read corpus {path}: {reason}")]
    CorpusRead { path: PathBuf, reason: String },

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("training step failed: {0}")]
    TrainingStep(String),

    #[error("checkpoint error at {path}: {reason}")]
    CheckpointWrite { path: PathBuf, reason: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

impl TradutorError {
    pub fn corpus(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::CorpusRead {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub fn checkpoint(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::CheckpointWrite {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}
