//! Transport boundary: where client audio enters and bot audio leaves.
//!
//! Network transports are out of scope; [`LocalTransport`] is the in-process
//! implementation used by the replay harness and tests. It exposes the same
//! surface a network transport would: an input stage, an output stage and a
//! connect/disconnect event table.

use crate::error::{PipelineError, Result};
use crate::events::EventHandlers;
use crate::frames::{AudioChunk, Frame};
use crate::processor::{FrameProcessor, StageContext};
use crate::ui::ClientMessage;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the client → bot channel.
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Audio settings of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportParams {
    /// Accept client audio.
    pub audio_in_enabled: bool,
    /// Deliver bot audio.
    pub audio_out_enabled: bool,
    /// Expected client sample rate in Hz.
    pub audio_in_sample_rate: u32,
    /// Bot audio sample rate in Hz.
    pub audio_out_sample_rate: u32,
    /// Bot audio channel count.
    pub audio_out_channels: u16,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            audio_in_enabled: false,
            audio_out_enabled: false,
            audio_in_sample_rate: 16_000,
            audio_out_sample_rate: 24_000,
            audio_out_channels: 1,
        }
    }
}

/// Transport flavours a session can be started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// WebRTC peer connection.
    #[default]
    WebRtc,
    /// WebSocket stream.
    WebSocket,
    /// In-process channels.
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebRtc => write!(f, "webrtc"),
            Self::WebSocket => write!(f, "websocket"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Lazily built transport parameters, one builder per kind.
///
/// Builders run only for the kind selected at session start, so expensive
/// setup for unused transports never happens.
#[derive(Debug, Clone)]
pub struct TransportParamsFactory {
    builders: HashMap<TransportKind, fn() -> TransportParams>,
}

fn duplex() -> TransportParams {
    TransportParams {
        audio_in_enabled: true,
        audio_out_enabled: true,
        ..TransportParams::default()
    }
}

impl Default for TransportParamsFactory {
    fn default() -> Self {
        Self::new()
            .with(TransportKind::WebRtc, duplex)
            .with(TransportKind::Local, duplex)
    }
}

impl TransportParamsFactory {
    /// Factory with no builders.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register (or replace) the builder for `kind`.
    pub fn with(mut self, kind: TransportKind, builder: fn() -> TransportParams) -> Self {
        self.builders.insert(kind, builder);
        self
    }

    /// Build the parameters for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if no builder is registered.
    pub fn select(&self, kind: TransportKind) -> Result<TransportParams> {
        let builder = self.builders.get(&kind).ok_or_else(|| {
            PipelineError::Config(format!("no transport parameters registered for {kind}"))
        })?;
        Ok(builder())
    }
}

/// Client connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEvent {
    /// A client joined.
    ClientConnected,
    /// A client left.
    ClientDisconnected,
}

/// Identity of a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client identifier.
    pub id: String,
}

impl ClientInfo {
    /// Create client info.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// The client's side of a [`LocalTransport`].
#[derive(Debug)]
pub struct ClientEnd {
    to_bot: mpsc::Sender<Frame>,
    from_bot: mpsc::UnboundedReceiver<AudioChunk>,
}

impl ClientEnd {
    /// Send microphone audio to the bot.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Channel`] once the transport is gone.
    pub async fn send_audio(&self, chunk: AudioChunk) -> Result<()> {
        self.send(Frame::Audio(chunk)).await
    }

    /// Send a UI message to the bot.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Channel`] once the transport is gone.
    pub async fn send_message(&self, message: ClientMessage) -> Result<()> {
        self.send(Frame::ClientMessage(message)).await
    }

    /// Send an arbitrary frame, e.g. recognizer output from a replay script.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Channel`] once the transport is gone.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.to_bot
            .send(frame)
            .await
            .map_err(|_| PipelineError::Channel("transport input closed".into()))
    }

    /// Next chunk of bot audio; `None` once the output stage is gone.
    pub async fn recv_audio(&mut self) -> Option<AudioChunk> {
        self.from_bot.recv().await
    }

    /// Bot audio already delivered, without waiting.
    pub fn drain_audio(&mut self) -> Vec<AudioChunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.from_bot.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }
}

/// In-process transport.
#[derive(Debug)]
pub struct LocalTransport {
    params: TransportParams,
    events: Arc<EventHandlers<TransportEvent, ClientInfo>>,
    input: Option<TransportInput>,
    output: Option<TransportOutput>,
}

impl LocalTransport {
    /// Create a transport and the client end connected to it.
    pub fn new(params: TransportParams) -> (Self, ClientEnd) {
        let (to_bot, from_client) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let (to_client, from_bot) = mpsc::unbounded_channel();
        let transport = Self {
            params,
            events: Arc::new(EventHandlers::new()),
            input: Some(TransportInput {
                params,
                client: Some(from_client),
                pump: None,
            }),
            output: Some(TransportOutput {
                params,
                client: to_client,
            }),
        };
        (transport, ClientEnd { to_bot, from_bot })
    }

    /// Transport settings.
    pub fn params(&self) -> &TransportParams {
        &self.params
    }

    /// Take the input stage; `None` once taken.
    pub fn input(&mut self) -> Option<TransportInput> {
        self.input.take()
    }

    /// Take the output stage; `None` once taken.
    pub fn output(&mut self) -> Option<TransportOutput> {
        self.output.take()
    }

    /// Register a connection event handler.
    pub fn on<F>(&self, kind: TransportEvent, handler: F)
    where
        F: Fn(ClientInfo) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.events.register(kind, handler);
    }

    /// Announce a client; handlers finish before this returns.
    pub async fn connect(&self, client: ClientInfo) {
        info!(client = %client.id, "client connected");
        self.events.emit(TransportEvent::ClientConnected, client).await;
    }

    /// Announce that a client left; handlers finish before this returns.
    pub async fn disconnect(&self, client: ClientInfo) {
        info!(client = %client.id, "client disconnected");
        self.events
            .emit(TransportEvent::ClientDisconnected, client)
            .await;
    }
}

/// First stage of a session: sources client frames.
#[derive(Debug)]
pub struct TransportInput {
    params: TransportParams,
    client: Option<mpsc::Receiver<Frame>>,
    pump: Option<JoinHandle<()>>,
}

impl TransportInput {
    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[async_trait]
impl FrameProcessor for TransportInput {
    fn name(&self) -> &str {
        "transport-input"
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        let Some(mut client) = self.client.take() else {
            return Err(PipelineError::Construction(
                "transport input started twice".into(),
            ));
        };
        let out = ctx.output();
        let hard_stop = ctx.hard_stop().clone();
        let audio_in = self.params.audio_in_enabled;
        self.pump = Some(tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = hard_stop.cancelled() => break,
                    frame = client.recv() => frame,
                };
                let Some(frame) = frame else {
                    debug!("client input closed");
                    break;
                };
                if matches!(frame, Frame::Audio(_)) && !audio_in {
                    continue;
                }
                if frame.is_system() {
                    warn!("client tried to inject a control signal, ignored");
                    continue;
                }
                if out.send(frame).await.is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
        ctx.forward(frame).await
    }

    async fn flush(&mut self, _ctx: &StageContext) -> Result<()> {
        self.stop_pump();
        Ok(())
    }

    async fn discard(&mut self) {
        self.stop_pump();
    }
}

/// Output stage: delivers bot audio to the client.
#[derive(Debug)]
pub struct TransportOutput {
    params: TransportParams,
    client: mpsc::UnboundedSender<AudioChunk>,
}

#[async_trait]
impl FrameProcessor for TransportOutput {
    fn name(&self) -> &str {
        "transport-output"
    }

    async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
        match frame {
            Frame::Audio(chunk) => {
                if self.params.audio_out_enabled && self.client.send(chunk).is_err() {
                    debug!("client gone, bot audio dropped");
                }
                Ok(())
            }
            other => ctx.forward(other).await,
        }
    }
}
