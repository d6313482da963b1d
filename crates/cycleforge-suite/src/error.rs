//! The suite orchestrator's top-level error type.

use cycleforge_core::security::UnknownSecurityLevel;
use cycleforge_llm::LlmConfigError;
use cycleforge_plugins::PluginConfigError;
use cycleforge_runner::RunnerError;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SuiteError {
    #[error("cycle '{cycle}': {message}")]
    Configuration { cycle: String, message: String },
    #[error(transparent)]
    Plugin(#[from] PluginConfigError),
    #[error(transparent)]
    Llm(#[from] LlmConfigError),
    #[error(transparent)]
    SecurityLevel(#[from] UnknownSecurityLevel),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("sink construction failed: {0}")]
    Sink(String),
    #[error("middleware construction failed: {0}")]
    Middleware(String),
}

impl SuiteError {
    pub fn configuration(cycle: &str, message: impl Into<String>) -> Self {
        SuiteError::Configuration { cycle: cycle.to_string(), message: message.into() }
    }
}
