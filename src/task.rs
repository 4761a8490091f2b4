//! Session lifecycle around one pipeline.
//!
//! A [`PipelineTask`] owns the pipeline, the observer tap and the session
//! state machine:
//!
//! ```text
//! Created ──run()──▶ Running ──▶ Completed     (EndOfStream reached the end)
//!    │                  ├──────▶ Cancelled     (cancel(), fatal stage error)
//!    │                  └──────▶ IdleTimedOut  (no traffic for idle_timeout)
//!    └──cancel()──────────────▶ Cancelled
//! ```
//!
//! The state is published on a `watch` channel so any [`TaskHandle`] can wait
//! for it. Shutdown broadcasts the terminating signal on the head's priority
//! lane, gives stages `cancel_grace` to stop, then trips the hard-stop token
//! and aborts whatever is left.

use crate::error::{PipelineError, Result};
use crate::frames::{ControlSignal, Frame, FrameKind};
use crate::observer::{FrameTap, Observer, ObserverMessage, spawn_observer};
use crate::pipeline::{LaunchContext, Pipeline};
use crate::processor::{
    DEFAULT_CHANNEL_CAPACITY, FrameSender, MetricsSettings, StageInput, link, sleep_until_deadline,
};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default idle window.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default time stages get to stop before they are forced.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Extra time `cancel()` waits beyond the grace period.
const CANCEL_WAIT_SLACK: Duration = Duration::from_secs(1);

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Constructed, not yet running.
    Created,
    /// Stages are running.
    Running,
    /// Stopped by request or by a fatal stage failure.
    Cancelled,
    /// All input was processed and flushed.
    Completed,
    /// Stopped after the idle window passed without traffic.
    IdleTimedOut,
}

impl TaskState {
    /// Whether the task has stopped for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::IdleTimedOut)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Completed => write!(f, "completed"),
            Self::IdleTimedOut => write!(f, "idle_timed_out"),
        }
    }
}

/// Task tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskParams {
    /// Idle window; `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Frame kinds that count as activity; `None` means all.
    pub idle_timeout_frames: Option<Vec<FrameKind>>,
    /// Time stages get to stop after a terminating signal.
    pub cancel_grace: Duration,
    /// Bounded data-lane capacity between stages.
    pub channel_capacity: usize,
    /// Emit TTFB / processing metrics.
    pub enable_metrics: bool,
    /// Emit token / character usage metrics.
    pub enable_usage_metrics: bool,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            idle_timeout_frames: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            enable_metrics: false,
            enable_usage_metrics: false,
        }
    }
}

impl TaskParams {
    /// Set the idle window.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Restrict which frame kinds reset the idle window.
    pub fn with_idle_timeout_frames(mut self, kinds: Vec<FrameKind>) -> Self {
        self.idle_timeout_frames = Some(kinds);
        self
    }

    /// Set the cancellation grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Enable metrics frames.
    pub fn with_metrics(mut self, enabled: bool, usage: bool) -> Self {
        self.enable_metrics = enabled;
        self.enable_usage_metrics = usage;
        self
    }
}

struct TaskShared {
    id: String,
    head: FrameSender,
    state: watch::Sender<TaskState>,
    cancel_requested: CancellationToken,
    cancel_wait: Duration,
}

/// Cloneable control surface of a task.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskHandle {
    /// Task identifier.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        *self.shared.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.shared.state.subscribe()
    }

    /// Inject a frame at the head of the pipeline.
    ///
    /// Frames may be queued before [`PipelineTask::run`]; once the head lane
    /// is full this waits until the task starts.
    ///
    /// # Errors
    ///
    /// Fails once the task is terminal, and for terminating control signals,
    /// which go through [`cancel`](Self::cancel).
    pub async fn queue_frame(&self, frame: Frame) -> Result<()> {
        if frame.is_system() {
            return Err(PipelineError::malformed(
                "task",
                "terminating signals are sent with cancel()",
            ));
        }
        let state = self.state();
        if state.is_terminal() {
            return Err(PipelineError::Channel(format!(
                "task {} already {state}",
                self.shared.id
            )));
        }
        self.shared.head.send(frame).await
    }

    /// Inject several frames, in order.
    ///
    /// # Errors
    ///
    /// Stops at the first frame that cannot be queued.
    pub async fn queue_frames(&self, frames: impl IntoIterator<Item = Frame>) -> Result<()> {
        for frame in frames {
            self.queue_frame(frame).await?;
        }
        Ok(())
    }

    /// Finish once everything queued so far has been processed.
    ///
    /// # Errors
    ///
    /// Fails once the task is terminal.
    pub async fn stop_when_done(&self) -> Result<()> {
        self.queue_frame(Frame::end_of_stream()).await
    }

    /// Cancel the task and wait until it is terminal.
    ///
    /// Idempotent. A task that never ran goes straight to `Cancelled`.
    pub async fn cancel(&self) {
        let never_ran = self.shared.state.send_if_modified(|state| {
            if *state == TaskState::Created {
                *state = TaskState::Cancelled;
                true
            } else {
                false
            }
        });
        if never_ran {
            info!(task = %self.shared.id, "task cancelled before it ran");
            return;
        }
        if !self.state().is_terminal() {
            debug!(task = %self.shared.id, "cancel requested");
        }
        self.shared.cancel_requested.cancel();
        if tokio::time::timeout(self.shared.cancel_wait, self.wait_terminal())
            .await
            .is_err()
        {
            warn!(task = %self.shared.id, "task did not stop within the cancel window");
        }
    }

    /// Wait until the task is terminal and return its final state.
    pub async fn wait_terminal(&self) -> TaskState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

/// One session: a pipeline plus its lifecycle.
pub struct PipelineTask {
    pipeline: Pipeline,
    params: TaskParams,
    shared: Arc<TaskShared>,
    tap: FrameTap,
    head_input: StageInput,
    activity: watch::Receiver<u64>,
    observers: Vec<(Box<dyn Observer>, mpsc::UnboundedReceiver<ObserverMessage>)>,
}

impl fmt::Debug for PipelineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTask")
            .field("id", &self.shared.id)
            .field("pipeline", &self.pipeline)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

enum Outcome {
    CancelRequested,
    Fatal(ControlSignal),
    Idle,
    Completed,
    Terminated,
    Disconnected,
}

impl PipelineTask {
    /// Wrap `pipeline` with the given params and observers.
    pub fn new(pipeline: Pipeline, params: TaskParams, observers: Vec<Box<dyn Observer>>) -> Self {
        let mut subscribers = Vec::with_capacity(observers.len());
        let observers = observers
            .into_iter()
            .map(|observer| {
                let (tx, rx) = mpsc::unbounded_channel();
                subscribers.push(tx);
                (observer, rx)
            })
            .collect();
        let activity_kinds = params
            .idle_timeout_frames
            .as_ref()
            .map(|kinds| kinds.iter().copied().collect::<HashSet<_>>());
        let (tap, activity) = FrameTap::new(subscribers, activity_kinds);

        let first = pipeline
            .stage_names()
            .into_iter()
            .next()
            .unwrap_or_else(|| "pipeline".to_owned());
        let (head, head_input) = link("task", &first, params.channel_capacity, tap.clone());
        let (state, _) = watch::channel(TaskState::Created);
        let id = uuid::Uuid::new_v4().to_string();
        let shared = Arc::new(TaskShared {
            id,
            head,
            state,
            cancel_requested: CancellationToken::new(),
            cancel_wait: params.cancel_grace + CANCEL_WAIT_SLACK,
        });
        Self {
            pipeline,
            params,
            shared,
            tap,
            head_input,
            activity,
            observers,
        }
    }

    /// Task identifier.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Control handle for this task.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the session until it reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Construction`] if a stage fails to start; the
    /// task is then `Cancelled`.
    pub async fn run(self) -> Result<TaskState> {
        let Self {
            mut pipeline,
            params,
            shared,
            tap,
            head_input,
            mut activity,
            observers,
        } = self;
        let task = shared.id.clone();

        let observer_handles: Vec<_> = observers
            .into_iter()
            .map(|(observer, rx)| spawn_observer(observer, rx))
            .collect();

        let started = shared.state.send_if_modified(|state| {
            if *state == TaskState::Created {
                *state = TaskState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            let state = *shared.state.borrow();
            info!(%task, %state, "task not started");
            tap.finish(state);
            join_observers(observer_handles, params.cancel_grace).await;
            return Ok(state);
        }

        let hard_stop = CancellationToken::new();
        let (upstream_tx, mut upstream_rx) = mpsc::unbounded_channel();
        let last = pipeline
            .stage_names()
            .pop()
            .unwrap_or_else(|| "pipeline".to_owned());
        let (tail_tx, mut tail) = link(&last, "task", params.channel_capacity, tap.clone());
        let launch_ctx = LaunchContext {
            tap: tap.clone(),
            upstream: upstream_tx,
            hard_stop: hard_stop.clone(),
            capacity: params.channel_capacity,
            metrics: MetricsSettings {
                enabled: params.enable_metrics,
                usage: params.enable_usage_metrics,
            },
        };
        let launched = tokio::select! {
            biased;
            () = shared.cancel_requested.cancelled() => None,
            result = pipeline.launch(head_input, tail_tx, &launch_ctx) => Some(result),
        };
        let running = match launched {
            Some(Ok(running)) => running,
            None => {
                // Stages not yet spawned are dropped with the launch future.
                hard_stop.cancel();
                info!(%task, "cancelled while starting");
                shared.state.send_replace(TaskState::Cancelled);
                tap.finish(TaskState::Cancelled);
                join_observers(observer_handles, params.cancel_grace).await;
                return Ok(TaskState::Cancelled);
            }
            Some(Err(e)) => {
                warn!(%task, "pipeline failed to start: {e}");
                shared.state.send_replace(TaskState::Cancelled);
                tap.finish(TaskState::Cancelled);
                join_observers(observer_handles, params.cancel_grace).await;
                return Err(e);
            }
        };
        info!(%task, "task running");

        let mut idle_deadline = params.idle_timeout.map(|t| Instant::now() + t);
        let outcome = loop {
            tokio::select! {
                biased;
                () = shared.cancel_requested.cancelled() => break Outcome::CancelRequested,
                Some(signal) = upstream_rx.recv() => match signal {
                    ControlSignal::Fatal { .. } => break Outcome::Fatal(signal),
                    ControlSignal::Cancel => break Outcome::CancelRequested,
                    other => debug!(%task, ?other, "ignoring upstream signal"),
                },
                Some(frame) = tail.system.recv() => {
                    debug!(%task, ?frame, "terminating signal reached the end");
                    break Outcome::Terminated;
                }
                frame = tail.data.recv() => match frame {
                    Some(Frame::Control(ControlSignal::EndOfStream)) => break Outcome::Completed,
                    Some(frame) => debug!(%task, kind = ?frame.kind(), "frame reached the end"),
                    None => break Outcome::Disconnected,
                },
                Ok(()) = activity.changed() => {
                    if let Some(window) = params.idle_timeout {
                        idle_deadline = Some(Instant::now() + window);
                    }
                }
                () = sleep_until_deadline(idle_deadline) => break Outcome::Idle,
            }
        };
        drop(tail);

        let (signal, final_state) = match outcome {
            Outcome::Completed => (None, TaskState::Completed),
            Outcome::CancelRequested => (Some(ControlSignal::Cancel), TaskState::Cancelled),
            Outcome::Fatal(signal) => {
                warn!(%task, ?signal, "stage failure, cancelling");
                (Some(signal), TaskState::Cancelled)
            }
            Outcome::Idle => {
                warn!(%task, "idle timeout, cancelling");
                (Some(ControlSignal::IdleTimeout), TaskState::IdleTimedOut)
            }
            Outcome::Terminated => (None, TaskState::Cancelled),
            Outcome::Disconnected => (Some(ControlSignal::Cancel), TaskState::Cancelled),
        };
        if let Some(signal) = signal
            && shared.head.send(Frame::Control(signal)).await.is_err()
        {
            debug!(%task, "first stage already stopped");
        }

        let exits = running.shutdown(params.cancel_grace, &hard_stop).await;
        debug!(%task, ?exits, "stages stopped");
        shared.state.send_replace(final_state);
        info!(%task, state = %final_state, "task finished");

        tap.finish(final_state);
        join_observers(observer_handles, params.cancel_grace).await;
        Ok(final_state)
    }
}

async fn join_observers(handles: Vec<tokio::task::JoinHandle<()>>, grace: Duration) {
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
        warn!("observers did not finish in time");
        for abort in aborts {
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::observer::FramePushed;
    use crate::processor::{FrameProcessor, StageContext};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Echo;

    #[async_trait]
    impl FrameProcessor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
            ctx.forward(frame).await
        }
    }

    /// Never finishes `process`; optionally never finishes `discard` either.
    struct Hang {
        stubborn: bool,
    }

    #[async_trait]
    impl FrameProcessor for Hang {
        fn name(&self) -> &str {
            "hang"
        }

        async fn process(&mut self, _frame: Frame, _ctx: &StageContext) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn discard(&mut self) {
            if self.stubborn {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Never finishes starting.
    struct NeverStarts;

    #[async_trait]
    impl FrameProcessor for NeverStarts {
        fn name(&self) -> &str {
            "never-starts"
        }

        async fn start(&mut self, _ctx: &StageContext) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
            ctx.forward(frame).await
        }
    }

    /// Fails fatally on `LlmRun`.
    struct Breaks;

    #[async_trait]
    impl FrameProcessor for Breaks {
        fn name(&self) -> &str {
            "breaks"
        }

        async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
            match frame {
                Frame::LlmRun => Err(PipelineError::fatal("breaks", "provider revoked key")),
                other => ctx.forward(other).await,
            }
        }
    }

    #[derive(Default, Clone)]
    struct Seen {
        frames: Arc<Mutex<Vec<FrameKind>>>,
        finished: Arc<Mutex<Option<TaskState>>>,
    }

    #[async_trait]
    impl Observer for Seen {
        async fn on_push_frame(&mut self, pushed: &FramePushed) {
            self.frames.lock().unwrap().push(pushed.frame.kind());
        }

        async fn on_pipeline_finished(&mut self, state: TaskState) {
            *self.finished.lock().unwrap() = Some(state);
        }
    }

    fn task(stages: Vec<Box<dyn FrameProcessor>>, params: TaskParams) -> PipelineTask {
        PipelineTask::new(Pipeline::new("test", stages).unwrap(), params, Vec::new())
    }

    #[tokio::test]
    async fn runs_to_completion_when_input_ends() {
        let seen = Seen::default();
        let task = PipelineTask::new(
            Pipeline::new("test", vec![Box::new(Echo), Box::new(Echo)]).unwrap(),
            TaskParams::default(),
            vec![Box::new(seen.clone())],
        );
        let handle = task.handle();
        handle.queue_frame(Frame::LlmRun).await.unwrap();
        handle.stop_when_done().await.unwrap();

        assert_eq!(task.run().await.unwrap(), TaskState::Completed);
        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(*seen.finished.lock().unwrap(), Some(TaskState::Completed));
        let frames = seen.frames.lock().unwrap();
        assert_eq!(
            frames.iter().filter(|k| **k == FrameKind::LlmRun).count(),
            3
        );
    }

    #[tokio::test]
    async fn cancel_before_run_skips_the_pipeline() {
        let task = task(vec![Box::new(Echo)], TaskParams::default());
        let handle = task.handle();
        handle.cancel().await;
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(task.run().await.unwrap(), TaskState::Cancelled);
        assert!(handle.queue_frame(Frame::LlmRun).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_stuck_stage_within_grace() {
        let params = TaskParams::default().with_cancel_grace(Duration::from_millis(500));
        let task = task(vec![Box::new(Echo), Box::new(Hang { stubborn: false })], params);
        let handle = task.handle();
        let runner = tokio::spawn(task.run());
        handle.queue_frame(Frame::LlmRun).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        handle.cancel().await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(runner.await.unwrap().unwrap(), TaskState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_a_stage_is_starting() {
        let seen = Seen::default();
        let task = PipelineTask::new(
            Pipeline::new("test", vec![Box::new(Echo), Box::new(NeverStarts)]).unwrap(),
            TaskParams::default().with_cancel_grace(Duration::from_millis(200)),
            vec![Box::new(seen.clone())],
        );
        let handle = task.handle();
        let runner = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), TaskState::Running);

        let started = Instant::now();
        handle.cancel().await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(runner.await.unwrap().unwrap(), TaskState::Cancelled);
        assert_eq!(*seen.finished.lock().unwrap(), Some(TaskState::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_stage_is_forced_after_grace() {
        let params = TaskParams::default().with_cancel_grace(Duration::from_millis(200));
        let task = task(vec![Box::new(Hang { stubborn: true })], params);
        let handle = task.handle();
        let runner = tokio::spawn(task.run());
        handle.queue_frame(Frame::LlmRun).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle.cancel().await;
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(runner.await.unwrap().unwrap(), TaskState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_times_out() {
        let params = TaskParams::default().with_idle_timeout(Some(Duration::from_secs(5)));
        let task = task(vec![Box::new(Echo)], params);
        let handle = task.handle();
        let started = Instant::now();
        assert_eq!(task.run().await.unwrap(), TaskState::IdleTimedOut);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(handle.state(), TaskState::IdleTimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_keeps_the_session_alive() {
        let params = TaskParams::default().with_idle_timeout(Some(Duration::from_secs(5)));
        let task = task(vec![Box::new(Echo)], params);
        let handle = task.handle();
        let runner = tokio::spawn(task.run());
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            handle.queue_frame(Frame::LlmRun).await.unwrap();
            assert_eq!(handle.state(), TaskState::Running);
        }
        assert_eq!(runner.await.unwrap().unwrap(), TaskState::IdleTimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn filtered_activity_ignores_other_frames() {
        let params = TaskParams::default()
            .with_idle_timeout(Some(Duration::from_secs(5)))
            .with_idle_timeout_frames(vec![FrameKind::TurnCommitted]);
        let task = task(vec![Box::new(Echo)], params);
        let handle = task.handle();
        let runner = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.queue_frame(Frame::LlmRun).await.unwrap();
        let started = Instant::now();
        assert_eq!(runner.await.unwrap().unwrap(), TaskState::IdleTimedOut);
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn fatal_stage_error_cancels_the_task() {
        let task = task(
            vec![Box::new(Echo), Box::new(Breaks)],
            TaskParams::default().with_idle_timeout(None),
        );
        let handle = task.handle();
        handle.queue_frame(Frame::LlmRun).await.unwrap();
        assert_eq!(task.run().await.unwrap(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn terminating_signals_cannot_be_queued() {
        let task = task(vec![Box::new(Echo)], TaskParams::default());
        let err = task.handle().queue_frame(Frame::cancel()).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedFrame { .. }));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let task = task(vec![Box::new(Echo)], TaskParams::default());
        let handle = task.handle();
        let runner = tokio::spawn(task.run());
        tokio::task::yield_now().await;
        handle.cancel().await;
        handle.cancel().await;
        assert_eq!(runner.await.unwrap().unwrap(), TaskState::Cancelled);
        assert_eq!(handle.wait_terminal().await, TaskState::Cancelled);
    }
}
