//! UI signaling between the session and its client.
//!
//! The client talks to the session through [`ClientMessage`]s that arrive as
//! frames; the session talks back with [`UiEvent`]s written to a UI sink. Two
//! pieces produce those events:
//!
//! - [`UiProcessor`], an in-line stage that handles the client-ready handshake
//!   and raises [`UiProcessorEvent::ClientReady`];
//! - [`UiObserver`], which watches the frame tap and reports transcripts,
//!   reply text, turns, errors and metrics where they originate.

use crate::error::Result;
use crate::events::EventHandlers;
use crate::frames::{ControlSignal, Frame, Role, SpeakerId};
use crate::metrics::MetricsData;
use crate::observer::{FramePushed, Observer};
use crate::processor::{FrameProcessor, StageContext};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Protocol version reported in `bot-ready`.
pub const UI_PROTOCOL_VERSION: &str = "1.0.0";

/// Message sent by the UI client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// The client finished its own setup and can receive events.
    ClientReady {
        /// Client protocol version, if reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    /// The client asks the bot to leave.
    DisconnectBot,
}

/// Event sent to the UI client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiEvent {
    /// The bot is ready for conversation.
    BotReady {
        /// Protocol version.
        version: String,
    },
    /// Recognizer output for the user.
    UserTranscription {
        /// Recognized text.
        text: String,
        /// `false` for partial results.
        #[serde(rename = "final")]
        is_final: bool,
        /// Speaker.
        speaker: SpeakerId,
    },
    /// A user turn was committed to history.
    UserTurn {
        /// Turn text.
        text: String,
        /// Speaker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speaker: Option<SpeakerId>,
    },
    /// The language model started a response.
    BotLlmStarted,
    /// One increment of reply text.
    BotLlmText {
        /// Token text.
        text: String,
    },
    /// The language model finished a response.
    BotLlmStopped,
    /// An assistant turn was committed to history.
    BotTurn {
        /// Turn text.
        text: String,
    },
    /// Synthesized audio was produced.
    BotTtsAudio {
        /// Payload length in bytes.
        bytes: usize,
        /// Sample rate in Hz.
        sample_rate: u32,
    },
    /// A stage reported an error.
    Error {
        /// Stage name.
        stage: String,
        /// Description.
        message: String,
        /// Whether the session is ending because of it.
        fatal: bool,
    },
    /// A metrics sample.
    Metrics {
        /// The sample.
        data: MetricsData,
    },
}

/// Events raised by the UI processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UiProcessorEvent {
    /// The client sent `client-ready`.
    ClientReady,
}

/// Cloneable handle to the UI side of a session.
#[derive(Clone)]
pub struct UiHandle {
    sink: mpsc::UnboundedSender<UiEvent>,
    events: Arc<EventHandlers<UiProcessorEvent, UiHandle>>,
    bot_ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for UiHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiHandle")
            .field("bot_ready", &self.is_bot_ready())
            .finish_non_exhaustive()
    }
}

impl UiHandle {
    /// Register a handler for a UI processor event.
    pub fn on<F>(&self, kind: UiProcessorEvent, handler: F)
    where
        F: Fn(UiHandle) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.events.register(kind, handler);
    }

    /// Tell the client the bot is ready. Only the first call sends.
    pub fn set_bot_ready(&self) {
        if self.bot_ready.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("bot ready");
        self.send(UiEvent::BotReady {
            version: UI_PROTOCOL_VERSION.to_owned(),
        });
    }

    /// Whether `bot-ready` has been sent.
    pub fn is_bot_ready(&self) -> bool {
        self.bot_ready.load(Ordering::SeqCst)
    }

    /// Send an event to the client.
    pub fn send(&self, event: UiEvent) {
        if self.sink.send(event).is_err() {
            debug!("UI client gone, event dropped");
        }
    }
}

/// In-line stage handling client messages.
#[derive(Debug)]
pub struct UiProcessor {
    handle: UiHandle,
    client_version: Option<String>,
}

impl UiProcessor {
    /// Create a processor writing events to `sink`.
    pub fn new(sink: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self {
            handle: UiHandle {
                sink,
                events: Arc::new(EventHandlers::new()),
                bot_ready: Arc::new(AtomicBool::new(false)),
            },
            client_version: None,
        }
    }

    /// Handle shared with event handlers and the session owner.
    pub fn handle(&self) -> UiHandle {
        self.handle.clone()
    }

    /// Version the client reported in `client-ready`.
    pub fn client_version(&self) -> Option<&str> {
        self.client_version.as_deref()
    }
}

#[async_trait]
impl FrameProcessor for UiProcessor {
    fn name(&self) -> &str {
        "rtvi"
    }

    async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
        match frame {
            Frame::ClientMessage(ClientMessage::ClientReady { version }) => {
                info!(?version, "client ready");
                self.client_version = version;
                self.handle
                    .events
                    .emit(UiProcessorEvent::ClientReady, self.handle.clone())
                    .await;
                Ok(())
            }
            Frame::ClientMessage(ClientMessage::DisconnectBot) => {
                info!("client asked the bot to disconnect");
                ctx.push_upstream(ControlSignal::Cancel);
                Ok(())
            }
            Frame::UiEvent(event) => {
                self.handle.send(event);
                Ok(())
            }
            other => ctx.forward(other).await,
        }
    }
}

/// Translates tapped frames into UI events.
///
/// Only frames at their origin are translated, so a token that crosses five
/// stage boundaries is reported once. Audio is reported only when it leaves
/// the synthesis stage.
#[derive(Debug)]
pub struct UiObserver {
    sink: mpsc::UnboundedSender<UiEvent>,
    audio_source: String,
}

impl UiObserver {
    /// Create an observer writing to `sink`.
    pub fn new(sink: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self {
            sink,
            audio_source: "tts".to_owned(),
        }
    }

    /// Stage whose audio output is reported as bot audio.
    pub fn with_audio_source(mut self, stage: impl Into<String>) -> Self {
        self.audio_source = stage.into();
        self
    }

    fn translate(&self, pushed: &FramePushed) -> Option<UiEvent> {
        if pushed.forwarded {
            return None;
        }
        let event = match &pushed.frame {
            Frame::TranscriptPartial(t) | Frame::TranscriptFinal(t) => UiEvent::UserTranscription {
                text: t.text.clone(),
                is_final: matches!(pushed.frame, Frame::TranscriptFinal(_)),
                speaker: t.speaker_id.clone(),
            },
            Frame::TurnCommitted(turn) => match turn.role {
                Role::User => UiEvent::UserTurn {
                    text: turn.text.clone(),
                    speaker: turn.speaker_id.clone(),
                },
                Role::Assistant => UiEvent::BotTurn {
                    text: turn.text.clone(),
                },
                Role::System => return None,
            },
            Frame::ResponseStart => UiEvent::BotLlmStarted,
            Frame::TextToken(text) => UiEvent::BotLlmText { text: text.clone() },
            Frame::ResponseEnd => UiEvent::BotLlmStopped,
            Frame::Audio(chunk) if pushed.source.as_ref() == self.audio_source => {
                UiEvent::BotTtsAudio {
                    bytes: chunk.bytes.len(),
                    sample_rate: chunk.sample_rate,
                }
            }
            Frame::Error(e) => UiEvent::Error {
                stage: e.stage.clone(),
                message: e.message.clone(),
                fatal: e.fatal,
            },
            Frame::Metrics(data) => UiEvent::Metrics { data: data.clone() },
            _ => return None,
        };
        Some(event)
    }
}

#[async_trait]
impl Observer for UiObserver {
    async fn on_push_frame(&mut self, pushed: &FramePushed) {
        if let Some(event) = self.translate(pushed) {
            let _ = self.sink.send(event);
        }
    }
}
