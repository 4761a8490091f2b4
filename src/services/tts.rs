//! Speech synthesis stage.
//!
//! Reply tokens pass straight through so the assistant aggregator and the UI
//! see them immediately; meanwhile they are buffered into sentences and each
//! complete sentence is synthesized. Audio for a sentence is pushed after the
//! token that completed it.

use super::retry::RetryPolicy;
use crate::error::Result;
use crate::frames::{AudioChunk, Frame};
use crate::metrics::{MetricsData, RequestTimer};
use crate::processor::{FrameProcessor, StageContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Minimum buffered length (bytes) before splitting on clause punctuation.
const CLAUSE_MIN_LEN: usize = 20;

/// Synthesizer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    /// Provider voice identifier.
    pub voice_id: String,
    /// Provider model name.
    pub model: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Also split on `, ; :` once enough text is buffered, for lower latency.
    pub split_on_clauses: bool,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            voice_id: "97U3B7htAA7UsCIDST8b".to_owned(),
            model: "eleven_turbo_v2_5".to_owned(),
            sample_rate: 24_000,
            split_on_clauses: false,
        }
    }
}

/// A text-to-speech backend.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one sentence.
    async fn synthesize(&self, text: &str, settings: &TtsSettings) -> Result<Vec<AudioChunk>>;
}

/// Find the byte index of a sentence-ending character (`.`, `!`, `?`, `\n`)
/// followed by whitespace or end of text.
pub(crate) fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return Some(i);
            }
        }
    }
    None
}

/// Like [`find_sentence_boundary`], but once the buffer holds at least
/// [`CLAUSE_MIN_LEN`] bytes also accepts the last clause mark (`, ; : — –`).
///
/// Returns the index of the last byte of the boundary character so
/// `text[..=pos]` stays on a char boundary.
pub(crate) fn find_clause_boundary(text: &str) -> Option<usize> {
    if let Some(pos) = find_sentence_boundary(text) {
        return Some(pos);
    }
    if text.len() < CLAUSE_MIN_LEN {
        return None;
    }
    let mut last_clause = None;
    for (i, c) in text.char_indices() {
        if matches!(c, ',' | ';' | ':' | '\u{2014}' | '\u{2013}') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') {
                last_clause = Some(i + c.len_utf8() - 1);
            }
        }
    }
    last_clause
}

/// Synthesis stage.
pub struct TtsProcessor {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    settings: TtsSettings,
    retry: RetryPolicy,
    buffer: String,
    timer: Option<RequestTimer>,
}

impl std::fmt::Debug for TtsProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsProcessor")
            .field("settings", &self.settings)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl TtsProcessor {
    /// Create a stage around `synthesizer`.
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, settings: TtsSettings) -> Self {
        Self {
            synthesizer,
            settings,
            retry: RetryPolicy::default(),
            buffer: String::new(),
            timer: None,
        }
    }

    /// Override the retry policy for synthesis calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn next_split(&self) -> Option<usize> {
        if self.settings.split_on_clauses {
            find_clause_boundary(&self.buffer)
        } else {
            find_sentence_boundary(&self.buffer)
        }
    }

    /// Synthesize every complete sentence in the buffer.
    async fn speak_complete(&mut self, ctx: &StageContext) -> Result<()> {
        while let Some(pos) = self.next_split() {
            let rest = self.buffer.split_off(pos + 1);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            self.speak(&sentence, ctx).await?;
        }
        Ok(())
    }

    /// Synthesize whatever is left in the buffer.
    async fn speak_remainder(&mut self, ctx: &StageContext) -> Result<()> {
        let rest = std::mem::take(&mut self.buffer);
        self.speak(&rest, ctx).await
    }

    async fn speak(&mut self, text: &str, ctx: &StageContext) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        debug!(chars = text.chars().count(), "synthesizing: {text}");
        let (synthesizer, settings) = (&self.synthesizer, &self.settings);
        let chunks = self
            .retry
            .run("tts", move || synthesizer.synthesize(text, settings))
            .await?;

        let metrics = ctx.metrics();
        if metrics.enabled
            && let Some(ttfb) = self.timer.as_mut().and_then(RequestTimer::first_byte)
        {
            ctx.push(Frame::Metrics(ttfb)).await?;
        }
        if metrics.usage {
            ctx.push(Frame::Metrics(MetricsData::TtsUsage {
                processor: ctx.name().to_owned(),
                characters: text.chars().count(),
            }))
            .await?;
        }
        for chunk in chunks {
            ctx.push(Frame::Audio(chunk)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FrameProcessor for TtsProcessor {
    fn name(&self) -> &str {
        "tts"
    }

    async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
        match frame {
            Frame::ResponseStart => {
                if !self.buffer.is_empty() {
                    warn!("response started with unspoken text, dropping it");
                    self.buffer.clear();
                }
                self.timer = Some(RequestTimer::start(ctx.name()));
                ctx.forward(Frame::ResponseStart).await
            }
            Frame::TextToken(token) => {
                self.buffer.push_str(&token);
                ctx.forward(Frame::TextToken(token)).await?;
                self.speak_complete(ctx).await
            }
            Frame::ResponseEnd => {
                let spoken = self.speak_remainder(ctx).await;
                ctx.forward(Frame::ResponseEnd).await?;
                if ctx.metrics().enabled
                    && let Some(timer) = self.timer.take()
                {
                    ctx.push(Frame::Metrics(timer.processing())).await?;
                }
                spoken
            }
            other => ctx.forward(other).await,
        }
    }

    async fn flush(&mut self, ctx: &StageContext) -> Result<()> {
        self.speak_remainder(ctx).await
    }

    async fn discard(&mut self) {
        self.buffer.clear();
        self.timer = None;
    }
}
