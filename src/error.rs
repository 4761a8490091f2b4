//! Error types for the humphrey pipeline.

/// Top-level error type for the conversational pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A recognizer / language-model / synthesizer call failed or timed out.
    ///
    /// Retryable by the stage that issued the call.
    #[error("{provider} provider error: {message}")]
    TransientProvider {
        /// Provider role (`stt`, `llm`, `tts`, ...).
        provider: String,
        /// Provider-reported failure.
        message: String,
    },

    /// A stage received a frame whose payload it cannot interpret.
    #[error("malformed frame at {stage}: {reason}")]
    MalformedFrame {
        /// Stage that rejected the frame.
        stage: String,
        /// Why the frame was rejected.
        reason: String,
    },

    /// Pipeline wiring is invalid (empty stage list, stage failed to start).
    #[error("pipeline construction error: {0}")]
    Construction(String),

    /// A stage lost something it cannot recover from locally.
    #[error("fatal error in {stage}: {reason}")]
    Fatal {
        /// Stage that failed.
        stage: String,
        /// Failure description.
        reason: String,
    },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the stage runner reacts to a failed `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Log and drop the offending frame.
    Drop,
    /// Log, report downstream, keep running.
    Recoverable,
    /// Report to the task so it cancels the session.
    Fatal,
}

impl PipelineError {
    /// Build a transient provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientProvider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Build a malformed-frame error.
    pub fn malformed(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Build a fatal stage error.
    pub fn fatal(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fatal {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Classify the error for the stage runner.
    pub fn severity(&self) -> Severity {
        match self {
            Self::MalformedFrame { .. } => Severity::Drop,
            Self::TransientProvider { .. } | Self::Config(_) | Self::Io(_) => {
                Severity::Recoverable
            }
            Self::Construction(_) | Self::Fatal { .. } | Self::Channel(_) => Severity::Fatal,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PipelineError>;
