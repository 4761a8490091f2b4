//! Ordered chains of stages.
//!
//! A [`Pipeline`] owns its stages until [`Pipeline::launch`] wires them
//! `input → stage[0] → … → stage[n-1] → output` and spawns one runner task per
//! stage. Because a pipeline is itself a [`FrameProcessor`], a chain can be
//! nested inside another chain as a single stage.

use crate::error::{PipelineError, Result};
use crate::frames::{ControlSignal, Frame};
use crate::observer::FrameTap;
use crate::processor::{
    FrameProcessor, FrameSender, MetricsSettings, StageContext, StageExit, StageInput, link,
    run_stage,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared wiring every stage of a launched pipeline receives.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    /// Observer tap for every link.
    pub tap: FrameTap,
    /// Where stages report fatal failures.
    pub upstream: mpsc::UnboundedSender<ControlSignal>,
    /// Forced-termination token.
    pub hard_stop: CancellationToken,
    /// Bounded data-lane capacity between stages.
    pub capacity: usize,
    /// Metrics switches.
    pub metrics: MetricsSettings,
}

/// An ordered, not-yet-running list of stages.
pub struct Pipeline {
    name: String,
    stages: Vec<Box<dyn FrameProcessor>>,
    nested: Option<Nested>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &names)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build a pipeline from `stages`, in data-flow order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Construction`] for an empty stage list.
    pub fn new(name: impl Into<String>, stages: Vec<Box<dyn FrameProcessor>>) -> Result<Self> {
        let name = name.into();
        if stages.is_empty() {
            return Err(PipelineError::Construction(format!(
                "pipeline {name} has no stages"
            )));
        }
        Ok(Self {
            name,
            stages,
            nested: None,
        })
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the stages have already been handed to a launched chain.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Names of the stages, in order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_owned()).collect()
    }

    /// Start every stage and spawn their runners.
    ///
    /// `input` feeds the first stage; `output` receives whatever the last
    /// stage pushes.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Construction`] if any stage fails to start.
    /// No runner is spawned in that case.
    pub async fn launch(
        &mut self,
        input: StageInput,
        output: FrameSender,
        ctx: &LaunchContext,
    ) -> Result<RunningPipeline> {
        if self.stages.is_empty() {
            return Err(PipelineError::Construction(format!(
                "pipeline {} was already launched",
                self.name
            )));
        }
        let stages = std::mem::take(&mut self.stages);
        let names: Vec<String> = stages.iter().map(|s| s.name().to_owned()).collect();

        // Build every link first so each stage starts with its real output.
        let mut inputs = Vec::with_capacity(stages.len());
        let mut outputs = Vec::with_capacity(stages.len());
        inputs.push(input);
        for pair in names.windows(2) {
            let (tx, rx) = link(&pair[0], &pair[1], ctx.capacity, ctx.tap.clone());
            outputs.push(tx);
            inputs.push(rx);
        }
        outputs.push(output);

        let mut prepared = Vec::with_capacity(stages.len());
        for ((mut stage, out), name) in stages.into_iter().zip(outputs).zip(&names) {
            let stage_ctx = StageContext::new(
                name,
                out,
                ctx.upstream.clone(),
                ctx.hard_stop.clone(),
                ctx.metrics,
                ctx.capacity,
            );
            stage.start(&stage_ctx).await.map_err(|e| {
                PipelineError::Construction(format!("stage {name} failed to start: {e}"))
            })?;
            prepared.push((stage, stage_ctx));
        }

        let handles = prepared
            .into_iter()
            .zip(inputs)
            .map(|((stage, stage_ctx), input)| tokio::spawn(run_stage(stage, input, stage_ctx)))
            .collect();
        info!(pipeline = %self.name, stages = ?names, "pipeline launched");
        Ok(RunningPipeline {
            name: self.name.clone(),
            handles,
        })
    }
}

/// Join handles of a launched pipeline.
#[derive(Debug)]
pub struct RunningPipeline {
    name: String,
    handles: Vec<JoinHandle<StageExit>>,
}

impl RunningPipeline {
    /// Wait for every stage to stop, forcing them after `grace`.
    ///
    /// Stages still running when the grace period expires see `hard_stop`
    /// fire and are then aborted. Returns how each stage ended, in order;
    /// aborted stages report [`StageExit::Forced`].
    pub async fn shutdown(self, grace: Duration, hard_stop: &CancellationToken) -> Vec<StageExit> {
        let deadline = Instant::now() + grace;
        let mut exits = Vec::with_capacity(self.handles.len());
        let mut forced = false;
        for mut handle in self.handles {
            let exit = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => joined.unwrap_or(StageExit::Forced),
                Err(_) => {
                    if !forced {
                        warn!(pipeline = %self.name, "grace period expired, forcing stop");
                        hard_stop.cancel();
                        forced = true;
                    }
                    handle.abort();
                    StageExit::Forced
                }
            };
            exits.push(exit);
        }
        debug!(pipeline = %self.name, ?exits, "pipeline stopped");
        exits
    }

    /// Wait for every stage to stop on its own.
    pub async fn join(self) -> Vec<StageExit> {
        let mut exits = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            exits.push(handle.await.unwrap_or(StageExit::Forced));
        }
        exits
    }
}

/// Runtime state of a pipeline used as a stage.
struct Nested {
    head: FrameSender,
    running: Option<RunningPipeline>,
    forwarder: Option<JoinHandle<()>>,
}

/// Relay the inner chain's output to the enclosing stage's output.
///
/// Data frames are forwarded in order; a terminating signal coming out of the
/// inner chain means the inner chain has already handled it, so it is not
/// relayed.
async fn relay(mut tail: StageInput, out: FrameSender) {
    loop {
        tokio::select! {
            biased;
            Some(frame) = tail.system.recv() => {
                debug!(?frame, "inner pipeline terminated");
                return;
            }
            frame = tail.data.recv() => match frame {
                Some(Frame::Control(ControlSignal::EndOfStream)) | None => return,
                Some(frame) => {
                    if out.forward(frame).await.is_err() {
                        return;
                    }
                }
            },
        }
    }
}

#[async_trait]
impl FrameProcessor for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        let launch_ctx = LaunchContext {
            tap: ctx.tap(),
            upstream: ctx.upstream_sender(),
            hard_stop: ctx.hard_stop().clone(),
            capacity: ctx.channel_capacity(),
            metrics: ctx.metrics(),
        };
        let first = self.stages.first().map(|s| s.name().to_owned());
        let last = self.stages.last().map(|s| s.name().to_owned());
        let (Some(first), Some(last)) = (first, last) else {
            return Err(PipelineError::Construction(format!(
                "pipeline {} was already launched",
                self.name
            )));
        };
        let capacity = launch_ctx.capacity;
        let (head, input) = link(&self.name, &first, capacity, launch_ctx.tap.clone());
        let (inner_out, tail) = link(&last, &self.name, capacity, launch_ctx.tap.clone());
        let running = self.launch(input, inner_out, &launch_ctx).await?;
        let forwarder = tokio::spawn(relay(tail, ctx.output()));
        self.nested = Some(Nested {
            head,
            running: Some(running),
            forwarder: Some(forwarder),
        });
        Ok(())
    }

    async fn process(&mut self, frame: Frame, _ctx: &StageContext) -> Result<()> {
        let Some(nested) = self.nested.as_ref() else {
            return Err(PipelineError::fatal(&self.name, "nested pipeline not started"));
        };
        nested
            .head
            .forward(frame)
            .await
            .map_err(|e| PipelineError::fatal(&self.name, e.to_string()))
    }

    async fn flush(&mut self, _ctx: &StageContext) -> Result<()> {
        let Some(nested) = self.nested.as_mut() else {
            return Ok(());
        };
        nested.head.forward(Frame::end_of_stream()).await?;
        if let Some(forwarder) = nested.forwarder.take() {
            let _ = forwarder.await;
        }
        if let Some(running) = nested.running.take() {
            running.join().await;
        }
        Ok(())
    }

    async fn discard(&mut self) {
        let Some(nested) = self.nested.as_mut() else {
            return;
        };
        if let Some(forwarder) = nested.forwarder.take() {
            forwarder.abort();
        }
        let _ = nested.head.forward(Frame::cancel()).await;
        if let Some(running) = nested.running.take() {
            running.join().await;
        }
    }
}
