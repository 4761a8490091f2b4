//! Frame types passed between pipeline stages.
//!
//! A [`Frame`] is the only thing that moves between stages. Frames are never
//! mutated after they are pushed; a stage that wants to revise content pushes a
//! new frame. Audio payloads use [`Bytes`] so fan-out to observers is a
//! reference-count bump rather than a copy.

use crate::error::{PipelineError, Result};
use crate::metrics::MetricsData;
use crate::ui::{ClientMessage, UiEvent};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw 16-bit little-endian PCM segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Interleaved PCM bytes.
    pub bytes: Bytes,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl AudioChunk {
    /// Create a chunk from raw PCM bytes.
    pub fn new(bytes: impl Into<Bytes>, sample_rate: u32, channels: u16) -> Self {
        Self {
            bytes: bytes.into(),
            sample_rate,
            channels,
        }
    }

    /// Create a chunk from `i16` samples.
    pub fn from_samples(samples: &[i16], sample_rate: u32, channels: u16) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Self::new(bytes, sample_rate, channels)
    }

    /// Number of frames (samples per channel) in the chunk.
    pub fn frame_count(&self) -> usize {
        let width = 2 * usize::from(self.channels.max(1));
        self.bytes.len() / width
    }

    /// Playback duration of the chunk.
    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(self.frame_count() as f64 / f64::from(self.sample_rate))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.sample_rate == 0 {
            return Err("audio chunk has a zero sample rate".to_owned());
        }
        if self.channels == 0 {
            return Err("audio chunk has zero channels".to_owned());
        }
        let width = 2 * usize::from(self.channels);
        if self.bytes.len() % width != 0 {
            return Err(format!(
                "audio chunk length {} is not a multiple of {width}",
                self.bytes.len()
            ));
        }
        Ok(())
    }
}

/// Speaker identity assigned by the recognizer (e.g. `S1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeakerId(String);

impl SpeakerId {
    /// Create a speaker identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpeakerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Recognizer output for one speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    /// Who spoke.
    pub speaker_id: SpeakerId,
    /// Recognized text.
    pub text: String,
    /// Recognizer timestamp of the utterance.
    pub timestamp: DateTime<Utc>,
}

impl Transcript {
    /// Create a transcript stamped with the current wall-clock time.
    pub fn new(speaker_id: impl Into<SpeakerId>, text: impl Into<String>) -> Self {
        Self {
            speaker_id: speaker_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Conversation role of a history entry or committed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User speech.
    User,
    /// Assistant output.
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A finalized conversational turn appended to history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedTurn {
    /// Who the turn belongs to.
    pub role: Role,
    /// Turn text.
    pub text: String,
    /// Speaker for user turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<SpeakerId>,
}

/// Error-signifying frame pushed downstream by a failing stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    /// Stage that produced the error.
    pub stage: String,
    /// Human-readable description.
    pub message: String,
    /// Whether the stage could not recover.
    pub fatal: bool,
}

/// Out-of-band signal travelling with the data frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Stop now; stages drop their state and terminate.
    Cancel,
    /// No more input; stages flush their state and terminate.
    EndOfStream,
    /// The session saw no traffic for the idle window.
    IdleTimeout,
    /// A stage hit an unrecoverable failure.
    Fatal {
        /// Stage that failed.
        stage: String,
        /// Failure description.
        reason: String,
    },
}

impl ControlSignal {
    /// Whether the signal terminates stages without flushing.
    pub fn is_terminating(&self) -> bool {
        !matches!(self, Self::EndOfStream)
    }
}

/// Discriminant of a [`Frame`], used for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Audio,
    TranscriptPartial,
    TranscriptFinal,
    LlmRun,
    AppendInstruction,
    ResponseStart,
    TextToken,
    ResponseEnd,
    TurnCommitted,
    ClientMessage,
    UiEvent,
    Metrics,
    Error,
    Control,
}

/// The atomic unit of data flowing through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Raw PCM audio.
    Audio(AudioChunk),
    /// Provisional recognition output, superseded by later partials.
    TranscriptPartial(Transcript),
    /// The recognizer's committed output for one utterance.
    TranscriptFinal(Transcript),
    /// Ask the language model to reply from the current history.
    LlmRun,
    /// Append a system instruction to history.
    AppendInstruction(String),
    /// Start of one generated response.
    ResponseStart,
    /// One increment of generated reply text.
    TextToken(String),
    /// End of one generated response.
    ResponseEnd,
    /// A finalized turn that has been appended to history.
    TurnCommitted(CommittedTurn),
    /// Message received from the UI client.
    ClientMessage(ClientMessage),
    /// Event destined for the UI client.
    UiEvent(UiEvent),
    /// Timing / usage metrics.
    Metrics(MetricsData),
    /// A stage failed while handling a frame.
    Error(ErrorFrame),
    /// Out-of-band control signal.
    Control(ControlSignal),
}

impl Frame {
    /// Shorthand for a cancel signal frame.
    pub fn cancel() -> Self {
        Self::Control(ControlSignal::Cancel)
    }

    /// Shorthand for an end-of-stream signal frame.
    pub fn end_of_stream() -> Self {
        Self::Control(ControlSignal::EndOfStream)
    }

    /// Discriminant of this frame.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Audio(_) => FrameKind::Audio,
            Self::TranscriptPartial(_) => FrameKind::TranscriptPartial,
            Self::TranscriptFinal(_) => FrameKind::TranscriptFinal,
            Self::LlmRun => FrameKind::LlmRun,
            Self::AppendInstruction(_) => FrameKind::AppendInstruction,
            Self::ResponseStart => FrameKind::ResponseStart,
            Self::TextToken(_) => FrameKind::TextToken,
            Self::ResponseEnd => FrameKind::ResponseEnd,
            Self::TurnCommitted(_) => FrameKind::TurnCommitted,
            Self::ClientMessage(_) => FrameKind::ClientMessage,
            Self::UiEvent(_) => FrameKind::UiEvent,
            Self::Metrics(_) => FrameKind::Metrics,
            Self::Error(_) => FrameKind::Error,
            Self::Control(_) => FrameKind::Control,
        }
    }

    /// Whether the frame travels on the priority lane.
    ///
    /// Terminating signals overtake queued data; `EndOfStream` stays inline so
    /// it is ordered after everything it flushes.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::Control(signal) if signal.is_terminating())
    }

    /// Check the payload for values no stage can interpret.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MalformedFrame`] naming `stage`.
    pub fn validate(&self, stage: &str) -> Result<()> {
        let problem = match self {
            Self::Audio(chunk) => chunk.validate().err(),
            Self::TranscriptPartial(t) | Self::TranscriptFinal(t)
                if t.speaker_id.as_str().trim().is_empty() =>
            {
                Some("transcript has an empty speaker id".to_owned())
            }
            _ => None,
        };
        match problem {
            Some(reason) => Err(PipelineError::malformed(stage, reason)),
            None => Ok(()),
        }
    }
}
