//! Side-channel observers of the frame stream.
//!
//! Every stage-to-stage link publishes a [`FramePushed`] record to a shared
//! [`FrameTap`] before handing the frame on. The tap fans each record out to
//! one unbounded channel per observer, and every observer is driven by its own
//! tokio task, so an observer that stalls only delays itself. The tap also
//! bumps the session's activity counter that drives the idle timeout.

use crate::frames::{Frame, FrameKind};
use crate::task::TaskState;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// A frame crossing one stage boundary.
#[derive(Debug, Clone)]
pub struct FramePushed {
    /// Stage that pushed the frame.
    pub source: Arc<str>,
    /// Stage that receives the frame.
    pub destination: Arc<str>,
    /// The frame itself.
    pub frame: Frame,
    /// `true` when the source passed the frame through unchanged,
    /// `false` when the source produced it.
    pub forwarded: bool,
    /// When the frame crossed the boundary.
    pub timestamp: Instant,
}

/// Message delivered to an observer task.
#[derive(Debug, Clone)]
pub(crate) enum ObserverMessage {
    Frame(Arc<FramePushed>),
    Finished(TaskState),
}

/// Listener attached to a running pipeline.
#[async_trait]
pub trait Observer: Send {
    /// Called for every frame crossing any stage boundary, in crossing order.
    async fn on_push_frame(&mut self, pushed: &FramePushed);

    /// Called once when the owning task reaches a terminal state.
    async fn on_pipeline_finished(&mut self, _state: TaskState) {}
}

struct TapInner {
    subscribers: Vec<mpsc::UnboundedSender<ObserverMessage>>,
    activity: watch::Sender<u64>,
    activity_kinds: Option<HashSet<FrameKind>>,
}

/// Fan-out point shared by every link of one task.
#[derive(Clone)]
pub struct FrameTap {
    inner: Arc<TapInner>,
}

impl std::fmt::Debug for FrameTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTap")
            .field("subscribers", &self.inner.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl Default for FrameTap {
    fn default() -> Self {
        Self::new(Vec::new(), None).0
    }
}

impl FrameTap {
    /// Build a tap feeding `subscribers`.
    ///
    /// `activity_kinds` restricts which frame kinds count as activity;
    /// `None` means every frame does. Returns the activity receiver.
    pub(crate) fn new(
        subscribers: Vec<mpsc::UnboundedSender<ObserverMessage>>,
        activity_kinds: Option<HashSet<FrameKind>>,
    ) -> (Self, watch::Receiver<u64>) {
        let (activity, activity_rx) = watch::channel(0);
        let tap = Self {
            inner: Arc::new(TapInner {
                subscribers,
                activity,
                activity_kinds,
            }),
        };
        (tap, activity_rx)
    }

    /// Publish one boundary crossing.
    pub(crate) fn publish(
        &self,
        source: &Arc<str>,
        destination: &Arc<str>,
        frame: &Frame,
        forwarded: bool,
    ) {
        let counts = self
            .inner
            .activity_kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&frame.kind()));
        if counts {
            self.inner.activity.send_modify(|n| *n = n.wrapping_add(1));
        }

        if self.inner.subscribers.is_empty() {
            return;
        }
        let pushed = Arc::new(FramePushed {
            source: Arc::clone(source),
            destination: Arc::clone(destination),
            frame: frame.clone(),
            forwarded,
            timestamp: Instant::now(),
        });
        for tx in &self.inner.subscribers {
            // A finished observer has dropped its receiver; nothing to do.
            let _ = tx.send(ObserverMessage::Frame(Arc::clone(&pushed)));
        }
    }

    /// Tell every observer the task is over.
    pub(crate) fn finish(&self, state: TaskState) {
        for tx in &self.inner.subscribers {
            let _ = tx.send(ObserverMessage::Finished(state));
        }
    }
}

/// Drive one observer until the task finishes or the tap goes away.
pub(crate) fn spawn_observer(
    mut observer: Box<dyn Observer>,
    mut rx: mpsc::UnboundedReceiver<ObserverMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                ObserverMessage::Frame(pushed) => observer.on_push_frame(&pushed).await,
                ObserverMessage::Finished(state) => {
                    observer.on_pipeline_finished(state).await;
                    return;
                }
            }
        }
        debug!("observer channel closed before task finished");
    })
}
