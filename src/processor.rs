//! Pipeline stages and the loop that drives them.
//!
//! A stage is any [`FrameProcessor`]. Each stage runs on its own tokio task
//! ([`run_stage`]) fed by two lanes:
//!
//! - a bounded **data lane** carrying ordinary frames and `EndOfStream`, in
//!   the order the upstream stage pushed them;
//! - an unbounded **priority lane** carrying terminating control signals
//!   (`Cancel`, `IdleTimeout`, `Fatal`), which overtake queued data.
//!
//! `process` calls are strictly sequential, so per-stage order is preserved.
//! Every `process` call is raced against the priority lane: a cancel that
//! arrives mid-call drops the in-flight future (abandoning any provider call
//! it was awaiting), the stage discards its state, forwards the signal and
//! exits without emitting anything else.

use crate::error::{PipelineError, Result, Severity};
use crate::frames::{ControlSignal, ErrorFrame, Frame};
use crate::observer::FrameTap;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default bounded capacity of a data lane.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Metrics switches visible to every stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSettings {
    /// Emit TTFB / processing-time frames.
    pub enabled: bool,
    /// Emit token / character usage frames.
    pub usage: bool,
}

/// A single pipeline stage.
#[async_trait]
pub trait FrameProcessor: Send {
    /// Stage name used in logs and observer records.
    fn name(&self) -> &str;

    /// One-time setup before any frame arrives.
    ///
    /// # Errors
    ///
    /// A failure here is a pipeline construction error.
    async fn start(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Handle one frame, pushing zero or more frames downstream.
    ///
    /// Frames the stage does not handle should be passed on with
    /// [`StageContext::forward`].
    async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()>;

    /// Next instant at which [`on_deadline`](Self::on_deadline) should run.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Called by the runner once [`deadline`](Self::deadline) has passed.
    async fn on_deadline(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Emit anything still buffered; called on `EndOfStream`.
    async fn flush(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Drop buffered state without emitting; called on terminating signals.
    async fn discard(&mut self) {}
}

/// Sending half of a stage-to-stage link.
#[derive(Clone)]
pub struct FrameSender {
    source: Arc<str>,
    destination: Arc<str>,
    data: mpsc::Sender<Frame>,
    system: mpsc::UnboundedSender<Frame>,
    tap: FrameTap,
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

impl FrameSender {
    /// Push a frame this side produced.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Channel`] once the receiving stage is gone.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.deliver(frame, false).await
    }

    /// Pass on a frame received from upstream.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Channel`] once the receiving stage is gone.
    pub async fn forward(&self, frame: Frame) -> Result<()> {
        self.deliver(frame, true).await
    }

    async fn deliver(&self, frame: Frame, forwarded: bool) -> Result<()> {
        self.tap
            .publish(&self.source, &self.destination, &frame, forwarded);
        if frame.is_system() {
            self.system.send(frame).map_err(|_| self.closed())
        } else {
            self.data.send(frame).await.map_err(|_| self.closed())
        }
    }

    fn closed(&self) -> PipelineError {
        PipelineError::Channel(format!("{} is no longer receiving", self.destination))
    }

    /// Name of the receiving stage.
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

/// Receiving half of a stage-to-stage link.
#[derive(Debug)]
pub struct StageInput {
    pub(crate) data: mpsc::Receiver<Frame>,
    pub(crate) system: mpsc::UnboundedReceiver<Frame>,
}

/// Create a link from `source` to `destination`.
pub fn link(
    source: &str,
    destination: &str,
    capacity: usize,
    tap: FrameTap,
) -> (FrameSender, StageInput) {
    let (data_tx, data_rx) = mpsc::channel(capacity.max(1));
    let (system_tx, system_rx) = mpsc::unbounded_channel();
    let sender = FrameSender {
        source: Arc::from(source),
        destination: Arc::from(destination),
        data: data_tx,
        system: system_tx,
        tap,
    };
    let input = StageInput {
        data: data_rx,
        system: system_rx,
    };
    (sender, input)
}

/// Everything a stage needs to talk to the rest of the session.
#[derive(Debug, Clone)]
pub struct StageContext {
    name: Arc<str>,
    out: FrameSender,
    upstream: mpsc::UnboundedSender<ControlSignal>,
    hard_stop: CancellationToken,
    metrics: MetricsSettings,
    capacity: usize,
}

impl StageContext {
    pub(crate) fn new(
        name: &str,
        out: FrameSender,
        upstream: mpsc::UnboundedSender<ControlSignal>,
        hard_stop: CancellationToken,
        metrics: MetricsSettings,
        capacity: usize,
    ) -> Self {
        Self {
            name: Arc::from(name),
            out,
            upstream,
            hard_stop,
            metrics,
            capacity,
        }
    }

    /// Name of the stage this context belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push a frame this stage produced.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Channel`] once downstream is gone.
    pub async fn push(&self, frame: Frame) -> Result<()> {
        self.out.send(frame).await
    }

    /// Pass an upstream frame through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Channel`] once downstream is gone.
    pub async fn forward(&self, frame: Frame) -> Result<()> {
        self.out.forward(frame).await
    }

    /// Report a signal to the owning task rather than downstream.
    pub fn push_upstream(&self, signal: ControlSignal) {
        if self.upstream.send(signal).is_err() {
            debug!(stage = %self.name, "task no longer listening for upstream signals");
        }
    }

    /// Clone of this stage's output link.
    pub fn output(&self) -> FrameSender {
        self.out.clone()
    }

    /// Token tripped when the task forces termination.
    pub fn hard_stop(&self) -> &CancellationToken {
        &self.hard_stop
    }

    /// Metrics switches for the session.
    pub fn metrics(&self) -> MetricsSettings {
        self.metrics
    }

    pub(crate) fn tap(&self) -> FrameTap {
        self.out.tap.clone()
    }

    pub(crate) fn upstream_sender(&self) -> mpsc::UnboundedSender<ControlSignal> {
        self.upstream.clone()
    }

    pub(crate) fn channel_capacity(&self) -> usize {
        self.capacity
    }
}

/// How a stage task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    /// Flushed on `EndOfStream` and forwarded it.
    Flushed,
    /// Discarded state on a terminating signal and forwarded it.
    Terminated,
    /// Upstream or downstream link closed.
    Disconnected,
    /// The task's hard-stop token fired.
    Forced,
}

enum Next {
    HardStop,
    System(Frame),
    Data(Option<Frame>),
    Deadline,
}

enum Guarded {
    HardStop,
    Interrupted(Frame),
    Done(Result<()>),
}

pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Run `work` unless a terminating signal or hard stop arrives first.
async fn guarded<F>(
    work: F,
    system: &mut mpsc::UnboundedReceiver<Frame>,
    hard_stop: &CancellationToken,
) -> Guarded
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        biased;
        () = hard_stop.cancelled() => Guarded::HardStop,
        Some(frame) = system.recv() => Guarded::Interrupted(frame),
        result = work => Guarded::Done(result),
    }
}

/// Drive one stage until it terminates.
pub async fn run_stage(
    mut stage: Box<dyn FrameProcessor>,
    mut input: StageInput,
    ctx: StageContext,
) -> StageExit {
    debug!(stage = %ctx.name(), "stage running");
    let exit = loop {
        let deadline = stage.deadline();
        let next = tokio::select! {
            biased;
            () = ctx.hard_stop.cancelled() => Next::HardStop,
            Some(frame) = input.system.recv() => Next::System(frame),
            () = sleep_until_deadline(deadline) => Next::Deadline,
            frame = input.data.recv() => Next::Data(frame),
        };

        let step = match next {
            Next::HardStop => break StageExit::Forced,
            Next::System(frame) => break terminate(stage.as_mut(), &ctx, frame).await,
            Next::Data(None) => {
                debug!(stage = %ctx.name(), "upstream closed");
                stage.discard().await;
                break StageExit::Disconnected;
            }
            Next::Data(Some(Frame::Control(ControlSignal::EndOfStream))) => {
                let outcome =
                    guarded(stage.flush(&ctx), &mut input.system, &ctx.hard_stop).await;
                match outcome {
                    Guarded::Done(result) => {
                        if let Err(e) = result {
                            warn!(stage = %ctx.name(), "flush failed: {e}");
                        }
                        if ctx.forward(Frame::end_of_stream()).await.is_err() {
                            break StageExit::Disconnected;
                        }
                        break StageExit::Flushed;
                    }
                    other => other,
                }
            }
            Next::Data(Some(frame)) if frame.is_system() => {
                break terminate(stage.as_mut(), &ctx, frame).await;
            }
            Next::Data(Some(frame)) => {
                guarded(stage.process(frame, &ctx), &mut input.system, &ctx.hard_stop).await
            }
            Next::Deadline => {
                guarded(stage.on_deadline(&ctx), &mut input.system, &ctx.hard_stop).await
            }
        };

        match step {
            Guarded::HardStop => break StageExit::Forced,
            Guarded::Interrupted(frame) => break terminate(stage.as_mut(), &ctx, frame).await,
            Guarded::Done(Ok(())) => {}
            Guarded::Done(Err(PipelineError::Channel(reason))) => {
                debug!(stage = %ctx.name(), "downstream closed: {reason}");
                stage.discard().await;
                break StageExit::Disconnected;
            }
            Guarded::Done(Err(e)) => report_failure(&ctx, e).await,
        }
    };
    info!(stage = %ctx.name(), ?exit, "stage stopped");
    exit
}

async fn terminate(stage: &mut dyn FrameProcessor, ctx: &StageContext, frame: Frame) -> StageExit {
    debug!(stage = %ctx.name(), ?frame, "terminating signal received");
    tokio::select! {
        biased;
        () = ctx.hard_stop.cancelled() => return StageExit::Forced,
        () = stage.discard() => {}
    }
    if ctx.forward(frame).await.is_err() {
        return StageExit::Disconnected;
    }
    StageExit::Terminated
}

async fn report_failure(ctx: &StageContext, err: PipelineError) {
    match err.severity() {
        Severity::Drop => {
            warn!(stage = %ctx.name(), "dropping frame: {err}");
        }
        Severity::Recoverable => {
            warn!(stage = %ctx.name(), "frame skipped: {err}");
            let frame = Frame::Error(ErrorFrame {
                stage: ctx.name().to_owned(),
                message: err.to_string(),
                fatal: false,
            });
            let _ = ctx.push(frame).await;
        }
        Severity::Fatal => {
            error!(stage = %ctx.name(), "unrecoverable stage failure: {err}");
            let frame = Frame::Error(ErrorFrame {
                stage: ctx.name().to_owned(),
                message: err.to_string(),
                fatal: true,
            });
            let _ = ctx.push(frame).await;
            ctx.push_upstream(ControlSignal::Fatal {
                stage: ctx.name().to_owned(),
                reason: err.to_string(),
            });
        }
    }
}
