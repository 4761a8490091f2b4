//! Session configuration.
//!
//! Every section is `#[serde(default)]`, so a config file only needs the keys
//! it changes.

use crate::aggregators::UserAggregatorParams;
use crate::error::{PipelineError, Result};
use crate::frames::FrameKind;
use crate::processor::DEFAULT_CHANNEL_CAPACITY;
use crate::services::{LlmOptions, RetryPolicy, SttSettings, TtsSettings};
use crate::task::TaskParams;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default assistant persona.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful and witty British assistant called Humphrey. \
Your goal is to demonstrate your capabilities in a succinct way. \
Your output will be spoken aloud, so avoid special characters that can't easily be spoken, such as emojis or bullet points. \
Always include punctuation in your responses. \
Give very short replies - do not give longer replies unless strictly necessary. \
Respond to what the user said in a concise, funny, creative and helpful way. \
Use `<Sn/>` tags to identify different speakers - do not use tags in your replies.";

/// Instruction appended when a client connects.
pub const DEFAULT_GREETING: &str = "Say a short hello to the user.";

/// Top-level configuration for one conversation session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Speech recognition.
    pub stt: SttSettings,
    /// Language model and persona.
    pub llm: LlmConfig,
    /// Speech synthesis.
    pub tts: TtsSettings,
    /// User-turn aggregation.
    pub user_turn: UserAggregatorParams,
    /// Session lifecycle.
    pub task: TaskConfig,
    /// Provider retry policy.
    pub retry: RetryPolicy,
    /// Transport selection.
    pub transport: TransportConfig,
}

/// Language model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on generated tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// System instruction seeding the history.
    pub system_prompt: String,
    /// Instruction appended when a client connects; empty disables the greeting.
    pub greeting: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let options = LlmOptions::default();
        Self {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            greeting: DEFAULT_GREETING.to_owned(),
        }
    }
}

impl LlmConfig {
    /// Generation options for the language model stage.
    pub fn options(&self) -> LlmOptions {
        LlmOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Seconds without traffic before the session ends; absent disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    /// Frame kinds that count as activity; absent means all frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_frames: Option<Vec<FrameKind>>,
    /// Milliseconds stages get to stop after cancellation.
    pub cancel_grace_ms: u64,
    /// Capacity of each stage-to-stage data lane.
    pub channel_capacity: usize,
    /// Emit latency metrics.
    pub enable_metrics: bool,
    /// Emit token and character usage metrics.
    pub enable_usage_metrics: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        let params = TaskParams::default();
        Self {
            idle_timeout_secs: params.idle_timeout.map(|d| d.as_secs()),
            idle_timeout_frames: None,
            cancel_grace_ms: params.cancel_grace.as_millis() as u64,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            enable_metrics: true,
            enable_usage_metrics: true,
        }
    }
}

impl From<&TaskConfig> for TaskParams {
    fn from(config: &TaskConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout_secs.map(Duration::from_secs),
            idle_timeout_frames: config.idle_timeout_frames.clone(),
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
            channel_capacity: config.channel_capacity.max(1),
            enable_metrics: config.enable_metrics,
            enable_usage_metrics: config.enable_usage_metrics,
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Which transport parameter set to use.
    pub kind: TransportKind,
}

impl SessionConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config file path (`config_dir()/config.toml`).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    /// Session parameters derived from the `task` section.
    pub fn task_params(&self) -> TaskParams {
        TaskParams::from(&self.task)
    }
}

/// Configuration directory.
///
/// Resolves to `dirs::config_dir()/humphrey/`. Override with the
/// `HUMPHREY_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("HUMPHREY_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("humphrey"))
        .unwrap_or_else(|| PathBuf::from("/tmp/humphrey-config"))
}
