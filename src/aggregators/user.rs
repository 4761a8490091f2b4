//! Turns streaming recognizer output into committed user turns.
//!
//! Each speaker gets its own buffer of finalized segments plus the latest
//! partial. Every transcript for a speaker re-arms that speaker's quiescence
//! deadline; once the deadline passes without another transcript the buffered
//! text is committed to history as one `User` turn.

use super::history::UserTurnWriter;
use crate::error::Result;
use crate::frames::{CommittedTurn, Frame, Role, SpeakerId, Transcript};
use crate::processor::{FrameProcessor, StageContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default quiescence window.
pub const DEFAULT_AGGREGATION_TIMEOUT: Duration = Duration::from_millis(5);

/// Tuning for the user turn aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAggregatorParams {
    /// How long a speaker must be silent before their turn is committed.
    #[serde(with = "millis", rename = "aggregation_timeout_ms")]
    pub aggregation_timeout: Duration,
}

impl Default for UserAggregatorParams {
    fn default() -> Self {
        Self {
            aggregation_timeout: DEFAULT_AGGREGATION_TIMEOUT,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug)]
struct PendingTurn {
    finals: Vec<String>,
    partial: Option<String>,
    deadline: Instant,
}

impl PendingTurn {
    fn resolve(self) -> String {
        let mut text = self.finals.join(" ");
        if let Some(partial) = self.partial {
            text.push(' ');
            text.push_str(&partial);
        }
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// The user half of the context aggregator pair.
#[derive(Debug)]
pub struct UserTurnAggregator {
    history: UserTurnWriter,
    params: UserAggregatorParams,
    pending: HashMap<SpeakerId, PendingTurn>,
}

impl UserTurnAggregator {
    /// Create an aggregator appending to `history`.
    pub fn new(history: UserTurnWriter, params: UserAggregatorParams) -> Self {
        Self {
            history,
            params,
            pending: HashMap::new(),
        }
    }

    async fn accept(
        &mut self,
        transcript: Transcript,
        is_final: bool,
        ctx: &StageContext,
    ) -> Result<()> {
        let now = Instant::now();
        // A turn whose window already closed is never extended.
        if self
            .pending
            .get(&transcript.speaker_id)
            .is_some_and(|turn| turn.deadline <= now)
        {
            let due = self.take_due(Some(now));
            self.commit(due, ctx).await?;
        }
        let deadline = now + self.params.aggregation_timeout;
        let turn = self
            .pending
            .entry(transcript.speaker_id)
            .or_insert_with(|| PendingTurn {
                finals: Vec::new(),
                partial: None,
                deadline,
            });
        turn.deadline = deadline;
        if is_final {
            turn.finals.push(transcript.text);
            turn.partial = None;
        } else {
            turn.partial = Some(transcript.text);
        }
        Ok(())
    }

    /// Remove and return due speakers, earliest deadline first.
    fn take_due(&mut self, now: Option<Instant>) -> Vec<(SpeakerId, PendingTurn)> {
        let due: Vec<SpeakerId> = self
            .pending
            .iter()
            .filter(|(_, turn)| now.is_none_or(|now| turn.deadline <= now))
            .map(|(speaker, _)| speaker.clone())
            .collect();
        let mut turns: Vec<(SpeakerId, PendingTurn)> = due
            .into_iter()
            .filter_map(|speaker| self.pending.remove_entry(&speaker))
            .collect();
        turns.sort_by(|a, b| a.1.deadline.cmp(&b.1.deadline).then_with(|| a.0.cmp(&b.0)));
        turns
    }

    async fn commit(
        &mut self,
        turns: Vec<(SpeakerId, PendingTurn)>,
        ctx: &StageContext,
    ) -> Result<()> {
        for (speaker, turn) in turns {
            let text = turn.resolve();
            if text.is_empty() {
                debug!(%speaker, "nothing to commit");
                continue;
            }
            info!(%speaker, "user turn committed: {text}");
            self.history.append_user(text.clone());
            ctx.push(Frame::TurnCommitted(CommittedTurn {
                role: Role::User,
                text,
                speaker_id: Some(speaker),
            }))
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FrameProcessor for UserTurnAggregator {
    fn name(&self) -> &str {
        "user-aggregator"
    }

    async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
        frame.validate(self.name())?;
        match frame {
            Frame::TranscriptPartial(t) => self.accept(t, false, ctx).await?,
            Frame::TranscriptFinal(t) => self.accept(t, true, ctx).await?,
            Frame::AppendInstruction(text) => self.history.append_system(text),
            other => ctx.forward(other).await?,
        }
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.pending.values().map(|turn| turn.deadline).min()
    }

    async fn on_deadline(&mut self, ctx: &StageContext) -> Result<()> {
        let due = self.take_due(Some(Instant::now()));
        self.commit(due, ctx).await
    }

    async fn flush(&mut self, ctx: &StageContext) -> Result<()> {
        let all = self.take_due(None);
        self.commit(all, ctx).await
    }

    async fn discard(&mut self) {
        if !self.pending.is_empty() {
            debug!(speakers = self.pending.len(), "discarding pending user turns");
        }
        self.pending.clear();
    }
}
