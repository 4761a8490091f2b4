//! End-to-end conversation scenarios over the full stage chain:
//! transport in → STT → user aggregator → LLM → UI → TTS → transport out →
//! assistant aggregator.
//!
//! Every provider is scripted and the tokio clock is paused, so timings are
//! exact.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use futures_util::StreamExt;
use humphrey::aggregators::{ContextAggregatorPair, DialogueHistory, HistoryEntry, HistoryReader};
use humphrey::frames::{AudioChunk, Frame, FrameKind, Role};
use humphrey::observer::{FramePushed, Observer};
use humphrey::services::{
    LanguageModel, LlmOptions, LlmProcessor, RecognizerEvent, SpeechRecognizer,
    SpeechSynthesizer, SttProcessor, SttSettings, TokenStream, TtsProcessor, TtsSettings,
};
use humphrey::transport::{
    ClientEnd, ClientInfo, LocalTransport, TransportEvent, TransportKind, TransportParamsFactory,
};
use humphrey::ui::{UiEvent, UiObserver, UiProcessor};
use humphrey::{
    Pipeline, PipelineTask, Result, TaskHandle, TaskParams, TaskState, UserAggregatorParams,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const SYSTEM_PROMPT: &str = "You are Humphrey.";
const WINDOW: Duration = Duration::from_millis(200);
const GRACE: Duration = Duration::from_millis(500);

// ── Scripted providers ───────────────────────────────────────────────────

/// Pops one batch of recognizer events per audio chunk.
struct ScriptedRecognizer {
    batches: Arc<Mutex<VecDeque<Vec<RecognizerEvent>>>>,
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn push_audio(&mut self, _chunk: &AudioChunk) -> Result<Vec<RecognizerEvent>> {
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// One scripted reply.
#[derive(Clone)]
struct Reply {
    tokens: Vec<&'static str>,
    token_delay: Duration,
    /// Stop producing tokens after this many and never finish.
    stall_after: Option<usize>,
}

impl Reply {
    fn quick(tokens: Vec<&'static str>) -> Self {
        Self {
            tokens,
            token_delay: Duration::ZERO,
            stall_after: None,
        }
    }

    fn slow(tokens: Vec<&'static str>, token_delay: Duration) -> Self {
        Self {
            tokens,
            token_delay,
            stall_after: None,
        }
    }
}

#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<Vec<HistoryEntry>>>,
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream(&self, history: &[HistoryEntry], _options: &LlmOptions) -> Result<TokenStream> {
        self.prompts.lock().unwrap().push(history.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::quick(vec!["Quite."]));
        let mut tokens = reply.tokens;
        let stall = reply.stall_after.is_some();
        if let Some(n) = reply.stall_after {
            tokens.truncate(n);
        }
        let delay = reply.token_delay;
        let stream = futures_util::stream::iter(tokens).then(move |token| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, humphrey::PipelineError>(token.to_owned())
        });
        if stall {
            Ok(Box::pin(stream.chain(futures_util::stream::pending())))
        } else {
            Ok(Box::pin(stream))
        }
    }
}

/// One chunk of silence per sentence; remembers what it spoke.
#[derive(Default)]
struct RecordingSynthesizer {
    spoken: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn synthesize(&self, text: &str, settings: &TtsSettings) -> Result<Vec<AudioChunk>> {
        self.spoken.lock().unwrap().push(text.to_owned());
        Ok(vec![AudioChunk::from_samples(
            &[0; 240],
            settings.sample_rate,
            1,
        )])
    }
}

/// Keeps every tapped frame, in crossing order.
#[derive(Clone, Default)]
struct Recorder {
    pushed: Arc<Mutex<Vec<FramePushed>>>,
}

#[async_trait]
impl Observer for Recorder {
    async fn on_push_frame(&mut self, pushed: &FramePushed) {
        self.pushed.lock().unwrap().push(pushed.clone());
    }
}

impl Recorder {
    fn snapshot(&self) -> Vec<FramePushed> {
        self.pushed.lock().unwrap().clone()
    }
}

// ── Session harness ──────────────────────────────────────────────────────

struct Session {
    client: ClientEnd,
    transport: LocalTransport,
    handle: TaskHandle,
    history: HistoryReader,
    recognizer: Arc<Mutex<VecDeque<Vec<RecognizerEvent>>>>,
    model: Arc<ScriptedModel>,
    synth: Arc<RecordingSynthesizer>,
    recorder: Recorder,
    ui: mpsc::UnboundedReceiver<UiEvent>,
    run: JoinHandle<Result<TaskState>>,
}

fn start(task_params: TaskParams, replies: Vec<Reply>) -> Session {
    let params = TransportParamsFactory::default()
        .select(TransportKind::Local)
        .unwrap();
    let (mut transport, client) = LocalTransport::new(params);
    let mut pair = ContextAggregatorPair::new(
        DialogueHistory::new(Some(SYSTEM_PROMPT.to_owned())),
        UserAggregatorParams {
            aggregation_timeout: WINDOW,
        },
    );
    let history = pair.history();
    let recognizer = Arc::new(Mutex::new(VecDeque::new()));
    let model = Arc::new(ScriptedModel {
        replies: Mutex::new(replies.into()),
        ..ScriptedModel::default()
    });
    let synth = Arc::new(RecordingSynthesizer::default());
    let (ui_tx, ui) = mpsc::unbounded_channel();
    let recorder = Recorder::default();

    let stages: Vec<Box<dyn humphrey::FrameProcessor>> = vec![
        Box::new(transport.input().unwrap()),
        Box::new(SttProcessor::new(
            Box::new(ScriptedRecognizer {
                batches: Arc::clone(&recognizer),
            }),
            SttSettings::default(),
        )),
        Box::new(pair.user().unwrap()),
        Box::new(LlmProcessor::new(
            Arc::clone(&model) as Arc<dyn LanguageModel>,
            history.clone(),
            LlmOptions::default(),
        )),
        Box::new(UiProcessor::new(ui_tx.clone())),
        Box::new(TtsProcessor::new(
            Arc::clone(&synth) as Arc<dyn SpeechSynthesizer>,
            TtsSettings::default(),
        )),
        Box::new(transport.output().unwrap()),
        Box::new(pair.assistant().unwrap()),
    ];
    let task = PipelineTask::new(
        Pipeline::new("conversation", stages).unwrap(),
        task_params.with_cancel_grace(GRACE),
        vec![
            Box::new(recorder.clone()),
            Box::new(UiObserver::new(ui_tx)),
        ],
    );
    let handle = task.handle();
    let run = tokio::spawn(task.run());
    Session {
        client,
        transport,
        handle,
        history,
        recognizer,
        model,
        synth,
        recorder,
        ui,
        run,
    }
}

fn no_idle() -> TaskParams {
    TaskParams::default().with_idle_timeout(None)
}

fn final_(speaker: &str, text: &str) -> RecognizerEvent {
    RecognizerEvent::Final {
        speaker_id: speaker.into(),
        text: text.into(),
    }
}

fn partial(speaker: &str, text: &str) -> RecognizerEvent {
    RecognizerEvent::Partial {
        speaker_id: speaker.into(),
        text: text.into(),
    }
}

impl Session {
    /// Feed one audio chunk that the recognizer turns into `events`.
    async fn hear(&self, events: Vec<RecognizerEvent>) {
        self.recognizer.lock().unwrap().push_back(events);
        self.client
            .send_audio(AudioChunk::from_samples(&[0; 160], 16_000, 1))
            .await
            .unwrap();
    }

    /// End the input, wait for the task and return the final history.
    async fn finish(mut self) -> (TaskState, Vec<HistoryEntry>, Session) {
        self.handle.stop_when_done().await.unwrap();
        let state = (&mut self.run).await.unwrap().unwrap();
        let history = self.history.snapshot();
        (state, history, self)
    }

    fn ui_events(&mut self) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.ui.try_recv() {
            events.push(event);
        }
        events
    }
}

fn dialogue(history: &[HistoryEntry]) -> Vec<(Role, &str)> {
    history.iter().map(|e| (e.role, e.text.as_str())).collect()
}

/// Index of the first record matching `pred`.
fn position(pushed: &[FramePushed], pred: impl Fn(&FramePushed) -> bool) -> Option<usize> {
    pushed.iter().position(pred)
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn two_speakers_take_turns() {
    let session = start(
        no_idle(),
        vec![
            Reply::quick(vec!["Hello", " there."]),
            Reply::quick(vec!["Welcome", " aboard."]),
        ],
    );
    session.hear(vec![final_("S1", "Hello Humphrey")]).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    session.hear(vec![final_("S2", "Hi, I'm new here")]).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (state, history, mut session) = session.finish().await;
    assert_eq!(state, TaskState::Completed);
    assert_eq!(
        dialogue(&history),
        vec![
            (Role::System, SYSTEM_PROMPT),
            (Role::User, "Hello Humphrey"),
            (Role::Assistant, "Hello there."),
            (Role::User, "<S2>Hi, I'm new here</S2>"),
            (Role::Assistant, "Welcome aboard."),
        ]
    );

    // The model saw the full history each time it ran.
    let prompts = session.model.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[1].len(), 4);

    assert_eq!(
        *session.synth.spoken.lock().unwrap(),
        vec!["Hello there.", "Welcome aboard."]
    );
    assert_eq!(session.client.drain_audio().len(), 2);

    let turns: Vec<UiEvent> = session
        .ui_events()
        .into_iter()
        .filter(|e| matches!(e, UiEvent::UserTurn { .. }))
        .collect();
    assert_eq!(
        turns,
        vec![
            UiEvent::UserTurn {
                text: "Hello Humphrey".into(),
                speaker: Some("S1".into()),
            },
            UiEvent::UserTurn {
                text: "<S2>Hi, I'm new here</S2>".into(),
                speaker: Some("S2".into()),
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn fragments_inside_the_window_merge_into_one_turn() {
    let session = start(no_idle(), vec![Reply::quick(vec!["Noted."])]);
    session.hear(vec![partial("S1", "I want")]).await;
    tokio::time::sleep(WINDOW / 2).await;
    session.hear(vec![final_("S1", "I want a pizza")]).await;
    tokio::time::sleep(WINDOW / 2).await;
    session.hear(vec![final_("S1", "with extra   cheese")]).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (_, history, session) = session.finish().await;
    assert_eq!(
        dialogue(&history[1..]),
        vec![
            (Role::User, "I want a pizza with extra cheese"),
            (Role::Assistant, "Noted."),
        ]
    );
    assert_eq!(session.model.prompts.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fragments_past_the_window_become_separate_turns() {
    let session = start(
        no_idle(),
        vec![Reply::quick(vec!["One."]), Reply::quick(vec!["Two."])],
    );
    session.hear(vec![final_("S1", "First thought")]).await;
    tokio::time::sleep(WINDOW * 3).await;
    session.hear(vec![final_("S1", "Second thought")]).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (_, history, _) = session.finish().await;
    assert_eq!(
        dialogue(&history[1..]),
        vec![
            (Role::User, "First thought"),
            (Role::Assistant, "One."),
            (Role::User, "Second thought"),
            (Role::Assistant, "Two."),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn a_lone_partial_is_never_committed_early() {
    let session = start(no_idle(), Vec::new());
    session.hear(vec![partial("S1", "Um")]).await;
    tokio::time::sleep(WINDOW / 2).await;
    assert_eq!(session.history.len(), 1);
    tokio::time::sleep(WINDOW).await;
    let history = session.history.snapshot();
    assert_eq!(dialogue(&history[1..])[0], (Role::User, "Um"));
    let (state, _, _) = session.finish().await;
    assert_eq!(state, TaskState::Completed);
}

#[tokio::test(start_paused = true)]
async fn tokens_reach_the_client_before_the_turn_is_committed() {
    let mut session = start(
        no_idle(),
        vec![Reply::slow(
            vec!["Well,", " that", " is", " splendid."],
            Duration::from_millis(100),
        )],
    );
    session.hear(vec![final_("S1", "I won the lottery")]).await;
    // Commit after the window, then two tokens.
    tokio::time::sleep(WINDOW + Duration::from_millis(250)).await;

    let texts: Vec<String> = session
        .ui_events()
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::BotLlmText { text } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["Well,", " that"]);
    assert!(
        session
            .history
            .snapshot()
            .iter()
            .all(|e| e.role != Role::Assistant)
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    let (_, history, session) = session.finish().await;
    assert_eq!(history.last().unwrap().text, "Well, that is splendid.");

    let pushed = session.recorder.snapshot();
    let last_token_in = pushed
        .iter()
        .rposition(|p| {
            p.frame.kind() == FrameKind::TextToken
                && p.destination.as_ref() == "assistant-aggregator"
        })
        .unwrap();
    let commit = position(&pushed, |p| {
        matches!(&p.frame, Frame::TurnCommitted(t) if t.role == Role::Assistant)
    })
    .unwrap();
    assert!(last_token_in < commit);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_every_stage_within_grace() {
    let mut session = start(
        no_idle(),
        vec![Reply::slow(
            vec!["This", " is", " a", " very", " long", " story."],
            Duration::from_millis(100),
        )],
    );
    session.hear(vec![final_("S1", "Tell me a story")]).await;
    tokio::time::sleep(WINDOW + Duration::from_millis(250)).await;

    let started = Instant::now();
    session.handle.cancel().await;
    assert!(started.elapsed() < GRACE);
    assert_eq!(session.handle.state(), TaskState::Cancelled);

    session.client.drain_audio();
    session.ui_events();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(session.client.drain_audio().is_empty());
    assert!(
        session
            .ui_events()
            .iter()
            .all(|e| !matches!(e, UiEvent::BotLlmText { .. } | UiEvent::BotTtsAudio { .. }))
    );

    // After a stage saw the cancel it emitted nothing more.
    let pushed = session.recorder.snapshot();
    for stage in ["stt", "user-aggregator", "llm", "rtvi", "tts", "assistant-aggregator"] {
        let Some(cancel_in) = position(&pushed, |p| {
            matches!(p.frame, Frame::Control(humphrey::ControlSignal::Cancel))
                && p.destination.as_ref() == stage
        }) else {
            continue;
        };
        assert!(
            pushed[cancel_in + 1..]
                .iter()
                .filter(|p| p.source.as_ref() == stage)
                .all(|p| p.frame.is_system()),
            "{stage} emitted after cancel"
        );
    }

    // The half-told story is not part of the conversation.
    assert!(
        session
            .history
            .snapshot()
            .iter()
            .all(|e| e.role != Role::Assistant)
    );
    assert_eq!(session.run.await.unwrap().unwrap(), TaskState::Cancelled);
    assert!(session.handle.queue_frame(Frame::LlmRun).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn quiet_session_times_out() {
    let started = Instant::now();
    let session = start(
        TaskParams::default().with_idle_timeout(Some(Duration::from_secs(2))),
        Vec::new(),
    );
    assert_eq!(session.run.await.unwrap().unwrap(), TaskState::IdleTimedOut);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn traffic_holds_off_the_idle_timeout() {
    let session = start(
        TaskParams::default().with_idle_timeout(Some(Duration::from_secs(2))),
        Vec::new(),
    );
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        session.hear(Vec::new()).await;
        assert_eq!(session.handle.state(), TaskState::Running);
    }
    let last_traffic = Instant::now();
    let state = session.handle.wait_terminal().await;
    assert_eq!(state, TaskState::IdleTimedOut);
    assert!(last_traffic.elapsed() >= Duration::from_secs(2));
    assert_eq!(session.run.await.unwrap().unwrap(), TaskState::IdleTimedOut);
}

#[tokio::test(start_paused = true)]
async fn history_follows_commit_order() {
    // The second utterance is committed while the first reply is still streaming.
    let session = start(
        no_idle(),
        vec![
            Reply::slow(vec!["Let", " me", " think."], Duration::from_millis(200)),
            Reply::quick(vec!["Sorry."]),
        ],
    );
    session.hear(vec![final_("S1", "What's the time?")]).await;
    tokio::time::sleep(WINDOW + Duration::from_millis(50)).await;
    session.hear(vec![final_("S1", "Hurry up")]).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let (_, history, session) = session.finish().await;
    let committed: Vec<(Role, String)> = session
        .recorder
        .snapshot()
        .into_iter()
        .filter(|p| !p.forwarded)
        .filter_map(|p| match p.frame {
            Frame::TurnCommitted(turn) => Some((turn.role, turn.text)),
            _ => None,
        })
        .collect();
    let recorded: Vec<(Role, String)> = history[1..]
        .iter()
        .map(|e| (e.role, e.text.clone()))
        .collect();
    assert_eq!(recorded, committed);
    assert_eq!(
        dialogue(&history[1..]),
        vec![
            (Role::User, "What's the time?"),
            (Role::User, "Hurry up"),
            (Role::Assistant, "Let me think."),
            (Role::Assistant, "Sorry."),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_reply_cancels_without_committing_it() {
    let mut session = start(
        no_idle(),
        vec![Reply {
            tokens: vec!["I", " was", " saying"],
            token_delay: Duration::from_millis(50),
            stall_after: Some(2),
        }],
    );
    let handle = session.handle.clone();
    session
        .transport
        .on(TransportEvent::ClientDisconnected, move |_client| {
            let handle = handle.clone();
            Box::pin(async move { handle.cancel().await })
        });

    session.hear(vec![final_("S1", "Go on then")]).await;
    tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;
    assert_eq!(session.handle.state(), TaskState::Running);

    session.transport.disconnect(ClientInfo::new("c1")).await;
    assert_eq!(session.handle.state(), TaskState::Cancelled);
    assert_eq!(
        dialogue(&session.history.snapshot()[1..]),
        vec![(Role::User, "Go on then")]
    );
    let started = session
        .ui_events()
        .iter()
        .filter(|e| matches!(e, UiEvent::BotLlmText { .. }))
        .count();
    assert_eq!(started, 2);
    assert_eq!(
        (&mut session.run).await.unwrap().unwrap(),
        TaskState::Cancelled
    );
}
