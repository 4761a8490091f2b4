//! Language-model stage.
//!
//! [`LlmProcessor`] replies from the current dialogue history whenever it is
//! asked to run (`LlmRun`) or a user turn has been committed. Each reply is
//! framed as `ResponseStart`, zero or more `TextToken`s, `ResponseEnd`.

use super::retry::RetryPolicy;
use crate::aggregators::{HistoryEntry, HistoryReader};
use crate::error::Result;
use crate::frames::{Frame, Role};
use crate::metrics::{MetricsData, RequestTimer};
use crate::processor::{FrameProcessor, StageContext};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A boxed stream of reply tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.75;

/// Generation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmOptions {
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on generated tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
        }
    }
}

/// A streaming chat-completion backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start streaming a reply to `history`.
    async fn stream(&self, history: &[HistoryEntry], options: &LlmOptions) -> Result<TokenStream>;
}

/// Language-model stage.
pub struct LlmProcessor {
    model: Arc<dyn LanguageModel>,
    history: HistoryReader,
    options: LlmOptions,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LlmProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmProcessor")
            .field("options", &self.options)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl LlmProcessor {
    /// Create a stage replying from `history`.
    pub fn new(model: Arc<dyn LanguageModel>, history: HistoryReader, options: LlmOptions) -> Self {
        Self {
            model,
            history,
            options,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy for opening a stream.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn respond(&self, ctx: &StageContext) -> Result<()> {
        let metrics = ctx.metrics();
        let mut timer = RequestTimer::start(ctx.name());
        let history = self.history.snapshot();
        debug!(entries = history.len(), "running language model");

        let (model, options, prompt) = (&self.model, &self.options, &history);
        let mut stream = self
            .retry
            .run("llm", move || model.stream(prompt, options))
            .await?;

        ctx.push(Frame::ResponseStart).await?;
        let mut completion_tokens = 0usize;
        let mut failure = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(token) if token.is_empty() => {}
                Ok(token) => {
                    if metrics.enabled
                        && let Some(ttfb) = timer.first_byte()
                    {
                        ctx.push(Frame::Metrics(ttfb)).await?;
                    }
                    completion_tokens += 1;
                    ctx.push(Frame::TextToken(token)).await?;
                }
                Err(e) => {
                    warn!(completion_tokens, "reply stream broke off: {e}");
                    failure = Some(e);
                    break;
                }
            }
        }
        ctx.push(Frame::ResponseEnd).await?;
        info!(completion_tokens, "response finished");

        if metrics.enabled {
            ctx.push(Frame::Metrics(timer.processing())).await?;
        }
        if metrics.usage {
            ctx.push(Frame::Metrics(MetricsData::LlmUsage {
                processor: ctx.name().to_owned(),
                prompt_messages: history.len(),
                completion_tokens,
            }))
            .await?;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FrameProcessor for LlmProcessor {
    fn name(&self) -> &str {
        "llm"
    }

    async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
        match frame {
            Frame::LlmRun => self.respond(ctx).await,
            Frame::TurnCommitted(turn) if turn.role == Role::User => {
                ctx.forward(Frame::TurnCommitted(turn)).await?;
                self.respond(ctx).await
            }
            other => ctx.forward(other).await,
        }
    }
}
