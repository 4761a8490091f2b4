//! Collects streamed reply tokens into committed assistant turns.

use super::history::AssistantTurnWriter;
use crate::error::Result;
use crate::frames::{CommittedTurn, Frame, Role};
use crate::processor::{FrameProcessor, StageContext};
use async_trait::async_trait;
use tracing::{debug, info};

/// The assistant half of the context aggregator pair.
///
/// Tokens are forwarded the moment they arrive; the turn is committed only
/// when the response ends, so a cancelled response never reaches history.
#[derive(Debug)]
pub struct AssistantTurnAggregator {
    history: AssistantTurnWriter,
    buffer: Option<String>,
}

impl AssistantTurnAggregator {
    /// Create an aggregator appending to `history`.
    pub fn new(history: AssistantTurnWriter) -> Self {
        Self {
            history,
            buffer: None,
        }
    }

    async fn commit(&mut self, ctx: &StageContext) -> Result<()> {
        let Some(text) = self.buffer.take() else {
            return Ok(());
        };
        if text.trim().is_empty() {
            debug!("empty response, nothing to commit");
            return Ok(());
        }
        info!("assistant turn committed: {text}");
        self.history.append_assistant(text.clone());
        ctx.push(Frame::TurnCommitted(CommittedTurn {
            role: Role::Assistant,
            text,
            speaker_id: None,
        }))
        .await
    }
}

#[async_trait]
impl FrameProcessor for AssistantTurnAggregator {
    fn name(&self) -> &str {
        "assistant-aggregator"
    }

    async fn process(&mut self, frame: Frame, ctx: &StageContext) -> Result<()> {
        match frame {
            Frame::ResponseStart => {
                if self.buffer.replace(String::new()).is_some() {
                    debug!("response restarted before it ended");
                }
                ctx.forward(Frame::ResponseStart).await
            }
            Frame::TextToken(token) => {
                self.buffer.get_or_insert_with(String::new).push_str(&token);
                ctx.forward(Frame::TextToken(token)).await
            }
            Frame::ResponseEnd => {
                ctx.forward(Frame::ResponseEnd).await?;
                self.commit(ctx).await
            }
            other => ctx.forward(other).await,
        }
    }

    /// Only `ResponseEnd` commits; a reply still open at end of input is dropped.
    async fn flush(&mut self, _ctx: &StageContext) -> Result<()> {
        self.discard().await;
        Ok(())
    }

    async fn discard(&mut self) {
        if self.buffer.take().is_some() {
            debug!("interrupted response discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::aggregators::history::{DialogueHistory, HistoryReader};
    use crate::frames::FrameKind;
    use crate::observer::FrameTap;
    use crate::processor::{FrameSender, MetricsSettings, StageInput, link, run_stage};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn rig() -> (
        FrameSender,
        StageInput,
        HistoryReader,
        tokio::task::JoinHandle<crate::processor::StageExit>,
    ) {
        let (_user, assistant, reader) = DialogueHistory::default().split();
        let tap = FrameTap::default();
        let (head, input) = link("output", "assistant-aggregator", 16, tap.clone());
        let (out, tail) = link("assistant-aggregator", "sink", 16, tap);
        let (upstream, _) = mpsc::unbounded_channel();
        let ctx = StageContext::new(
            "assistant-aggregator",
            out,
            upstream,
            CancellationToken::new(),
            MetricsSettings::default(),
            16,
        );
        let handle = tokio::spawn(run_stage(
            Box::new(AssistantTurnAggregator::new(assistant)),
            input,
            ctx,
        ));
        (head, tail, reader, handle)
    }

    async fn send_all(head: &FrameSender, frames: Vec<Frame>) {
        for frame in frames {
            head.send(frame).await.unwrap();
        }
    }

    #[tokio::test]
    async fn tokens_are_forwarded_before_the_turn_commits() {
        let (head, mut tail, reader, _handle) = rig();
        send_all(
            &head,
            vec![
                Frame::ResponseStart,
                Frame::TextToken("Hel".into()),
                Frame::TextToken("lo.".into()),
            ],
        )
        .await;

        assert_eq!(tail.data.recv().await, Some(Frame::ResponseStart));
        assert_eq!(tail.data.recv().await, Some(Frame::TextToken("Hel".into())));
        assert_eq!(tail.data.recv().await, Some(Frame::TextToken("lo.".into())));
        assert!(reader.is_empty());

        head.send(Frame::ResponseEnd).await.unwrap();
        assert_eq!(tail.data.recv().await, Some(Frame::ResponseEnd));
        let Some(Frame::TurnCommitted(turn)) = tail.data.recv().await else {
            panic!("expected committed turn");
        };
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(turn.text, "Hello.");
        assert_eq!(reader.snapshot()[0].text, "Hello.");
    }

    #[tokio::test]
    async fn cancelled_response_is_not_committed() {
        let (head, mut tail, reader, handle) = rig();
        send_all(&head, vec![Frame::ResponseStart, Frame::TextToken("Hi".into())]).await;
        tokio::task::yield_now().await;
        head.send(Frame::cancel()).await.unwrap();
        handle.await.unwrap();

        let mut kinds = Vec::new();
        while let Some(frame) = tail.data.recv().await {
            kinds.push(frame.kind());
        }
        assert!(!kinds.contains(&FrameKind::TurnCommitted));
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn unterminated_response_is_dropped_at_end_of_input() {
        let (head, mut tail, reader, handle) = rig();
        send_all(
            &head,
            vec![
                Frame::ResponseStart,
                Frame::TextToken("Half a".into()),
                Frame::end_of_stream(),
            ],
        )
        .await;
        handle.await.unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = tail.data.recv().await {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![
                Frame::ResponseStart,
                Frame::TextToken("Half a".into()),
                Frame::end_of_stream()
            ]
        );
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn empty_response_commits_nothing() {
        let (head, mut tail, reader, handle) = rig();
        send_all(
            &head,
            vec![Frame::ResponseStart, Frame::ResponseEnd, Frame::end_of_stream()],
        )
        .await;
        handle.await.unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = tail.data.recv().await {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![Frame::ResponseStart, Frame::ResponseEnd, Frame::end_of_stream()]
        );
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn token_without_start_opens_a_response() {
        let (head, _tail, reader, handle) = rig();
        send_all(
            &head,
            vec![
                Frame::TextToken("Sure".into()),
                Frame::ResponseEnd,
                Frame::end_of_stream(),
            ],
        )
        .await;
        handle.await.unwrap();
        assert_eq!(reader.snapshot()[0].text, "Sure");
    }
}
