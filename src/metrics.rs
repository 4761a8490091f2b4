//! Timing and usage metrics emitted by service stages.
//!
//! Metrics travel as ordinary [`Frame::Metrics`](crate::frames::Frame::Metrics)
//! frames so observers can pick them up without a second channel.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// One metrics sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsData {
    /// Time from request to the first byte/token of the response.
    Ttfb {
        /// Stage that measured it.
        processor: String,
        /// Seconds.
        value: f64,
    },
    /// Total time spent producing one response.
    Processing {
        /// Stage that measured it.
        processor: String,
        /// Seconds.
        value: f64,
    },
    /// Language-model token usage for one response.
    LlmUsage {
        /// Stage that measured it.
        processor: String,
        /// Number of history entries sent with the request.
        prompt_messages: usize,
        /// Number of tokens streamed back.
        completion_tokens: usize,
    },
    /// Characters sent to the synthesizer.
    TtsUsage {
        /// Stage that measured it.
        processor: String,
        /// Character count.
        characters: usize,
    },
}

/// Stopwatch for a single request, reporting TTFB once.
#[derive(Debug)]
pub struct RequestTimer {
    processor: String,
    started: Instant,
    first_byte: Option<Duration>,
}

impl RequestTimer {
    /// Start timing a request for `processor`.
    pub fn start(processor: impl Into<String>) -> Self {
        Self {
            processor: processor.into(),
            started: Instant::now(),
            first_byte: None,
        }
    }

    /// Mark the first byte; returns the TTFB sample only on the first call.
    pub fn first_byte(&mut self) -> Option<MetricsData> {
        if self.first_byte.is_some() {
            return None;
        }
        let elapsed = self.started.elapsed();
        self.first_byte = Some(elapsed);
        Some(MetricsData::Ttfb {
            processor: self.processor.clone(),
            value: elapsed.as_secs_f64(),
        })
    }

    /// Total processing time so far.
    pub fn processing(&self) -> MetricsData {
        MetricsData::Processing {
            processor: self.processor.clone(),
            value: self.started.elapsed().as_secs_f64(),
        }
    }
}
