//! Shared dialogue history with one writer per role.
//!
//! The arena is split once into a [`UserTurnWriter`], an
//! [`AssistantTurnWriter`] and any number of [`HistoryReader`]s. Neither
//! writer is `Clone`, so exactly one user-side and one assistant-side stage can
//! append, and each only the roles it owns.

use crate::frames::Role;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One entry of dialogue history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Who produced the entry.
    pub role: Role,
    /// Entry text.
    pub text: String,
}

impl HistoryEntry {
    /// Create an entry.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

type Store = Arc<RwLock<Vec<HistoryEntry>>>;

fn read(store: &Store) -> RwLockReadGuard<'_, Vec<HistoryEntry>> {
    store.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(store: &Store) -> RwLockWriteGuard<'_, Vec<HistoryEntry>> {
    store.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session-scoped dialogue history, before it is split into writers.
#[derive(Debug)]
pub struct DialogueHistory {
    store: Store,
}

impl DialogueHistory {
    /// Create a history, optionally seeded with a system instruction.
    pub fn new(seed: Option<String>) -> Self {
        let entries = seed
            .filter(|s| !s.trim().is_empty())
            .map(|s| vec![HistoryEntry::new(Role::System, s)])
            .unwrap_or_default();
        Self {
            store: Arc::new(RwLock::new(entries)),
        }
    }

    /// Hand out the two writers and a reader.
    pub fn split(self) -> (UserTurnWriter, AssistantTurnWriter, HistoryReader) {
        (
            UserTurnWriter {
                store: Arc::clone(&self.store),
            },
            AssistantTurnWriter {
                store: Arc::clone(&self.store),
            },
            HistoryReader { store: self.store },
        )
    }
}

impl Default for DialogueHistory {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Appends `User` and `System` entries.
#[derive(Debug)]
pub struct UserTurnWriter {
    store: Store,
}

impl UserTurnWriter {
    /// Append a user turn.
    pub fn append_user(&mut self, text: impl Into<String>) {
        write(&self.store).push(HistoryEntry::new(Role::User, text));
    }

    /// Append a system instruction.
    pub fn append_system(&mut self, text: impl Into<String>) {
        write(&self.store).push(HistoryEntry::new(Role::System, text));
    }
}

/// Appends `Assistant` entries.
#[derive(Debug)]
pub struct AssistantTurnWriter {
    store: Store,
}

impl AssistantTurnWriter {
    /// Append an assistant turn.
    pub fn append_assistant(&mut self, text: impl Into<String>) {
        write(&self.store).push(HistoryEntry::new(Role::Assistant, text));
    }
}

/// Read-only view of the history.
#[derive(Debug, Clone)]
pub struct HistoryReader {
    store: Store,
}

impl HistoryReader {
    /// Copy of every entry so far.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        read(&self.store).clone()
    }

    /// Number of entries so far.
    pub fn len(&self) -> usize {
        read(&self.store).len()
    }

    /// Whether the history has no entries.
    pub fn is_empty(&self) -> bool {
        read(&self.store).is_empty()
    }
}
