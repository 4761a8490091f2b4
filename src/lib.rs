//! Humphrey: streaming conversational pipeline.
//!
//! A session is a linear chain of stages connected by async channels:
//! Transport in → STT → user aggregator → LLM → UI → TTS → Transport out →
//! assistant aggregator
//!
//! # Architecture
//!
//! - **Frames** ([`frames`]): the only thing that moves between stages
//! - **Processors** ([`processor`]): one tokio task per stage, with a bounded
//!   data lane and an unbounded priority lane for terminating signals
//! - **Aggregators** ([`aggregators`]): turn streaming transcripts and reply
//!   tokens into committed dialogue turns on a shared history
//! - **Task** ([`task`]): session lifecycle, cancellation and idle timeout
//! - **Observers** ([`observer`]): side-channel listeners, e.g. the UI bridge
//!
//! Speech recognition, language model and synthesis providers are plugged in
//! through the traits in [`services`].

pub mod aggregators;
pub mod config;
pub mod error;
pub mod events;
pub mod frames;
pub mod metrics;
pub mod observer;
pub mod pipeline;
pub mod processor;
pub mod runner;
pub mod services;
pub mod task;
pub mod transport;
pub mod ui;

pub use aggregators::{ContextAggregatorPair, DialogueHistory, HistoryEntry, UserAggregatorParams};
pub use config::SessionConfig;
pub use error::{PipelineError, Result, Severity};
pub use frames::{AudioChunk, ControlSignal, Frame, FrameKind, Role, SpeakerId, Transcript};
pub use observer::{FramePushed, Observer};
pub use pipeline::Pipeline;
pub use processor::{FrameProcessor, StageContext};
pub use runner::PipelineRunner;
pub use task::{PipelineTask, TaskHandle, TaskParams, TaskState};
pub use transport::{LocalTransport, TransportKind, TransportParams, TransportParamsFactory};
pub use ui::{UiEvent, UiObserver, UiProcessor};
