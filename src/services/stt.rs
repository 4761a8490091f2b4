//! Speech recognition stage.

use super::retry::RetryPolicy;
use crate::error::Result;
use crate::frames::{AudioChunk, Frame, SpeakerId, Transcript};
use crate::processor::{FrameProcessor, StageContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};

/// Default speaker tagging applied once several speakers are active.
pub const DEFAULT_SPEAKER_ACTIVE_FORMAT: &str = "<{speaker_id}>{text}</{speaker_id}>";

/// Recognition language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// English.
    #[default]
    En,
    /// German.
    De,
    /// Spanish.
    Es,
    /// French.
    Fr,
    /// Italian.
    It,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::En => "en",
            Self::De => "de",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::It => "it",
        };
        f.write_str(code)
    }
}

/// Recognizer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    /// Recognition language.
    pub language: Language,
    /// Template for tagging text once more than one speaker has been heard.
    /// `{speaker_id}` and `{text}` are substituted. `None` disables tagging.
    pub speaker_active_format: Option<String>,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            language: Language::En,
            speaker_active_format: Some(DEFAULT_SPEAKER_ACTIVE_FORMAT.to_owned()),
        }
    }
}

/// Output of a recognizer for one audio chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Provisional text, superseded by later events.
    Partial {
        /// Diarized speaker.
        speaker_id: SpeakerId,
        /// Text so far.
        text: String,
    },
    /// Committed text for one utterance.
    Final {
        /// Diarized speaker.
        speaker_id: SpeakerId,
        /// Utterance text.
        text: String,
    },
}

/// A streaming speech recognizer session.
#[async_trait]
pub trait SpeechRecognizer: Send {
    /// Open the session.
    async fn connect(&mut self, _settings: &SttSettings) -> Result<()> {
        Ok(())
    }

    /// Feed audio; returns whatever the recognizer produced meanwhile.
    async fn push_audio(&mut self, chunk: &AudioChunk) -> Result<Vec<RecognizerEvent>>;

    /// Flush pending recognition at end of input.
    async fn finish(&mut self) -> Result<Vec<RecognizerEvent>> {
        Ok(Vec::new())
    }

    /// Drop pending recognition state.
    async fn reset(&mut self) {}
}

/// Recognition stage: audio in, transcripts out.
pub struct SttProcessor {
    recognizer: Box<dyn SpeechRecognizer>,
    settings: SttSettings,
    retry: RetryPolicy,
    speakers: HashSet<SpeakerId>,
}

impl fmt::Debug for SttProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SttProcessor")
            .field("settings", &self.settings)
            .field("speakers", &self.speakers)
            .finish_non_exhaustive()
    }
}

impl SttProcessor {
    /// Create a stage around `recognizer`.
    pub fn new(recognizer: Box<dyn SpeechRecognizer>, settings: SttSettings) -> Self {
        Self {
            recognizer,
            settings,
            retry: RetryPolicy::default(),
            speakers: HashSet::new(),
        }
    }

    /// Override the retry policy for recognizer calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn format(&self, speaker_id: &SpeakerId, text: String) -> String {
        match &self.settings.speaker_active_format {
            Some(template) if self.speakers.len() > 1 => template
                .replace("{speaker_id}", speaker_id.as_str())
                .replace("{text}", &text),
            _ => text,
        }
    }

    async fn emit(&mut self, events: Vec<RecognizerEvent>, ctx: &StageContext) -> Result<()> {
        for event in events {
            let (speaker_id, text, is_final) = match event {
                RecognizerEvent::Partial { speaker_id, text } => (speaker_id, text, false),
                RecognizerEvent::Final { speaker_id, text } => (speaker_id, text, true),
            };
            if text.trim().is_empty() {
                continue;
            }
            if self.speakers.insert(speaker_id.clone()) {
                info!(speaker = %speaker_id, total = self.speakers.len(), "new speaker");
            }
            let text = self.format(&speaker_id, text);
            let transcript = Transcript::new(speaker_id, text);
            let frame = if is_final {
                Frame::TranscriptFinal(transcript)
            } else {
                Frame::TranscriptPartial(transcript)
            };
            ctx.push(frame).await?;
        }
        Ok(())
    }

    async fn recognize(&mut self, chunk: &AudioChunk) -> Result<Vec<RecognizerEvent>> {
        let mut attempt = 0;
        loop {
            match self.recognizer.push_audio(chunk).await {
                Ok(events) => return Ok(events),
                Err(e) => self.retry.backoff("recognizer", &mut attempt, e).await?,
            }
        }
    }
}

#[async_trait]
impl FrameProcessor for SttProcessor {
    fn name(&self) -> &str {
        "stt"
    }

    async fn start(&mut self, _ctx: &StageContext) -> Result<()> {
        info!(language = %self.settings.language, "connecting recognizer");
        self.recognizer.connect(&self.settings).await
    }

    async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
        let Frame::Audio(chunk) = &frame else {
            return ctx.forward(frame).await;
        };
        frame.validate(self.name())?;
        let events = self.recognize(chunk).await?;
        self.emit(events, ctx).await
    }

    async fn flush(&mut self, ctx: &StageContext) -> Result<()> {
        let events = self.recognizer.finish().await?;
        self.emit(events, ctx).await
    }

    async fn discard(&mut self) {
        debug!("resetting recognizer");
        self.recognizer.reset().await;
    }
}
