//! The cycle runner's top-level error type.

use cycleforge_artifacts::PipelineError;
use cycleforge_prompts::PromptError;

use crate::checkpoint::CheckpointError;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunnerError {
    #[error("failed to compile cycle prompts: {0}")]
    PromptCompile(#[from] PromptError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("artifact pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}
