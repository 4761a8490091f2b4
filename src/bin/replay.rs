//! Replay recorded recognizer output through a full session.
//!
//! Each script entry is fed as one recognizer event, after its delay, through
//! the same stage chain a live session uses. The language model echoes the
//! user and synthesis produces silence, so the committed history shows exactly
//! how the quiescence window grouped the transcripts.

use async_trait::async_trait;
use clap::Parser;
use humphrey::aggregators::{ContextAggregatorPair, DialogueHistory, HistoryEntry};
use humphrey::frames::{AudioChunk, Frame, Role};
use humphrey::services::{
    LanguageModel, LlmOptions, LlmProcessor, RecognizerEvent, SpeechRecognizer,
    SpeechSynthesizer, SttProcessor, TokenStream, TtsProcessor, TtsSettings,
};
use humphrey::transport::{ClientInfo, LocalTransport, TransportEvent, TransportParamsFactory};
use humphrey::ui::{UiEvent, UiObserver, UiProcessor};
use humphrey::{Pipeline, PipelineRunner, PipelineTask, SessionConfig};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Replay a transcript script through the conversation pipeline.
#[derive(Parser)]
#[command(name = "humphrey-replay", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON array of `{speaker, text, final, delay_ms}` entries.
    #[arg(short, long)]
    script: PathBuf,

    /// How long to let the bot settle after the last entry.
    #[arg(long, default_value_t = 500)]
    settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptEntry {
    speaker: String,
    text: String,
    #[serde(rename = "final", default = "default_final")]
    is_final: bool,
    #[serde(default)]
    delay_ms: u64,
}

fn default_final() -> bool {
    true
}

/// Yields one scripted event per audio chunk.
struct ScriptedRecognizer {
    events: VecDeque<RecognizerEvent>,
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn push_audio(&mut self, _chunk: &AudioChunk) -> humphrey::Result<Vec<RecognizerEvent>> {
        Ok(self.events.pop_front().into_iter().collect())
    }
}

/// Answers every user turn by repeating it.
struct EchoModel;

#[async_trait]
impl LanguageModel for EchoModel {
    async fn stream(
        &self,
        history: &[HistoryEntry],
        _options: &LlmOptions,
    ) -> humphrey::Result<TokenStream> {
        let reply = match history.iter().rev().find(|e| e.role != Role::Assistant) {
            Some(entry) if entry.role == Role::User => format!("You said: {}.", entry.text),
            _ => "Hello there.".to_owned(),
        };
        let tokens: Vec<humphrey::Result<String>> = reply
            .split_inclusive(' ')
            .map(|t| Ok(t.to_owned()))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(tokens)))
    }
}

/// Produces 10 ms of silence per character.
struct SilentSynthesizer;

#[async_trait]
impl SpeechSynthesizer for SilentSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        settings: &TtsSettings,
    ) -> humphrey::Result<Vec<AudioChunk>> {
        let samples = text.chars().count() * settings.sample_rate as usize / 100;
        Ok(vec![AudioChunk::from_samples(
            &vec![0; samples],
            settings.sample_rate,
            1,
        )])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("humphrey=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = if let Some(ref path) = cli.config {
        SessionConfig::from_file(path)?
    } else {
        SessionConfig::default()
    };
    let script: Vec<ScriptEntry> = serde_json::from_str(&std::fs::read_to_string(&cli.script)?)?;
    info!(entries = script.len(), "loaded script");

    let events = script
        .iter()
        .map(|entry| {
            let speaker_id = entry.speaker.as_str().into();
            let text = entry.text.clone();
            if entry.is_final {
                RecognizerEvent::Final { speaker_id, text }
            } else {
                RecognizerEvent::Partial { speaker_id, text }
            }
        })
        .collect();

    let params = TransportParamsFactory::default().select(config.transport.kind)?;
    let (mut transport, client) = LocalTransport::new(params);
    let mut pair = ContextAggregatorPair::new(
        DialogueHistory::new(Some(config.llm.system_prompt.clone())),
        config.user_turn,
    );
    let history = pair.history();
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let ui = UiProcessor::new(ui_tx.clone());
    let ui_handle = ui.handle();

    let stt = SttProcessor::new(
        Box::new(ScriptedRecognizer { events }),
        config.stt.clone(),
    )
    .with_retry_policy(config.retry.clone());
    let llm = LlmProcessor::new(Arc::new(EchoModel), history.clone(), config.llm.options())
        .with_retry_policy(config.retry.clone());
    let tts = TtsProcessor::new(Arc::new(SilentSynthesizer), config.tts.clone())
        .with_retry_policy(config.retry.clone());

    let (Some(input), Some(output), Some(user), Some(assistant)) = (
        transport.input(),
        transport.output(),
        pair.user(),
        pair.assistant(),
    ) else {
        anyhow::bail!("session stages were already taken");
    };
    let pipeline = Pipeline::new(
        "humphrey",
        vec![
            Box::new(input),
            Box::new(stt),
            Box::new(user),
            Box::new(llm),
            Box::new(ui),
            Box::new(tts),
            Box::new(output),
            Box::new(assistant),
        ],
    )?;
    let task = PipelineTask::new(
        pipeline,
        config.task_params(),
        vec![Box::new(UiObserver::new(ui_tx))],
    );
    let handle = task.handle();

    let greeting = config.llm.greeting.clone();
    let greeter = handle.clone();
    transport.on(TransportEvent::ClientConnected, move |client| {
        let handle = greeter.clone();
        let greeting = greeting.clone();
        Box::pin(async move {
            info!(client = %client.id, "greeting client");
            let mut frames = Vec::new();
            if !greeting.trim().is_empty() {
                frames.push(Frame::AppendInstruction(greeting));
            }
            frames.push(Frame::LlmRun);
            if let Err(e) = handle.queue_frames(frames).await {
                warn!("could not queue greeting: {e}");
            }
        })
    });
    let canceller = handle.clone();
    transport.on(TransportEvent::ClientDisconnected, move |_client| {
        let handle = canceller.clone();
        Box::pin(async move { handle.cancel().await })
    });
    ui_handle.on(humphrey::ui::UiProcessorEvent::ClientReady, |ui| {
        Box::pin(async move { ui.set_bot_ready() })
    });

    let ui_log = tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => debug!(target: "humphrey::ui", "{json}"),
                Err(e) => warn!("unserializable UI event: {e}"),
            }
            if let UiEvent::Error { fatal: true, .. } = event {
                warn!("session reported a fatal error");
            }
        }
    });

    let runner = PipelineRunner::new();
    let session = tokio::spawn(async move { runner.run(task).await });

    let visitor = ClientInfo::new("replay");
    transport.connect(visitor.clone()).await;
    client
        .send_message(humphrey::ui::ClientMessage::ClientReady { version: None })
        .await?;
    let silence = AudioChunk::from_samples(&[0; 160], params.audio_in_sample_rate, 1);
    for entry in &script {
        tokio::time::sleep(Duration::from_millis(entry.delay_ms)).await;
        client.send_audio(silence.clone()).await?;
    }
    tokio::time::sleep(config.user_turn.aggregation_timeout + Duration::from_millis(cli.settle_ms))
        .await;
    if handle.stop_when_done().await.is_err() {
        transport.disconnect(visitor).await;
    }

    let state = session.await??;
    ui_log.abort();
    info!(%state, "session finished");

    println!("{}", serde_json::to_string_pretty(&history.snapshot())?);
    Ok(())
}
