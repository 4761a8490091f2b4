//! Dialogue-turn aggregation.
//!
//! [`ContextAggregatorPair`] splits one [`DialogueHistory`] between the user
//! aggregator (placed after speech recognition) and the assistant aggregator
//! (placed after audio output), so each side appends only its own turns.

pub mod assistant;
pub mod history;
pub mod user;

pub use assistant::AssistantTurnAggregator;
pub use history::{
    AssistantTurnWriter, DialogueHistory, HistoryEntry, HistoryReader, UserTurnWriter,
};
pub use user::{DEFAULT_AGGREGATION_TIMEOUT, UserAggregatorParams, UserTurnAggregator};

/// Both aggregators of one conversation, sharing a history.
#[derive(Debug)]
pub struct ContextAggregatorPair {
    user: Option<UserTurnAggregator>,
    assistant: Option<AssistantTurnAggregator>,
    reader: HistoryReader,
}

impl ContextAggregatorPair {
    /// Split `history` between a new user and assistant aggregator.
    pub fn new(history: DialogueHistory, params: UserAggregatorParams) -> Self {
        let (user, assistant, reader) = history.split();
        Self {
            user: Some(UserTurnAggregator::new(user, params)),
            assistant: Some(AssistantTurnAggregator::new(assistant)),
            reader,
        }
    }

    /// Take the user aggregator; `None` once it has been taken.
    pub fn user(&mut self) -> Option<UserTurnAggregator> {
        self.user.take()
    }

    /// Take the assistant aggregator; `None` once it has been taken.
    pub fn assistant(&mut self) -> Option<AssistantTurnAggregator> {
        self.assistant.take()
    }

    /// Read access to the shared history.
    pub fn history(&self) -> HistoryReader {
        self.reader.clone()
    }
}
