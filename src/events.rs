//! Typed event subscription tables.
//!
//! Collaborators that raise session events (the transport, the UI processor)
//! each own an [`EventHandlers`] table keyed by their own event enum. Handlers
//! are async and run to completion, in registration order, before the raiser
//! continues.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

type Handler<A> = Arc<dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync>;

/// Subscription table mapping an event kind to its handlers.
pub struct EventHandlers<K, A> {
    handlers: Mutex<HashMap<K, Vec<Handler<A>>>>,
}

impl<K, A> std::fmt::Debug for EventHandlers<K, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers").finish_non_exhaustive()
    }
}

impl<K, A> Default for EventHandlers<K, A> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, A> EventHandlers<K, A>
where
    K: Eq + Hash,
    A: Clone + Send + 'static,
{
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    ///
    /// ```ignore
    /// transport.on(TransportEvent::ClientConnected, move |_client| {
    ///     let handle = handle.clone();
    ///     Box::pin(async move { handle.queue_frame(Frame::LlmRun).await.ok(); })
    /// });
    /// ```
    pub fn register<F>(&self, kind: K, handler: F)
    where
        F: Fn(A) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let mut table = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        table.entry(kind).or_default().push(Arc::new(handler));
    }

    /// Run every handler registered for `kind`, one after another.
    pub async fn emit(&self, kind: K, arg: A) {
        let handlers: Vec<Handler<A>> = {
            let table = self
                .handlers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            table.get(&kind).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler(arg.clone()).await;
        }
    }

    /// Number of handlers registered for `kind`.
    pub fn count(&self, kind: &K) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(kind)
            .map_or(0, Vec::len)
    }
}
