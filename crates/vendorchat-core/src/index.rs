use crate::event::EventReceiver;
use crate::store::MessageStore;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use vendorchat_api::Conversation;

/// Ordered, filterable view over the store's conversations.
///
/// The ordering is memoized and dropped whenever the store reports a change.
pub struct ConversationIndex {
    store: MessageStore,
    changes: EventReceiver,
    cached: Option<Arc<Vec<Conversation>>>,
}

impl ConversationIndex {
    pub fn new(store: MessageStore) -> Self {
        let changes = store.subscribe();
        Self {
            store,
            changes,
            cached: None,
        }
    }

    fn drain_changes(&mut self) {
        loop {
            match self.changes.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => self.cached = None,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    /// Conversations by last activity, newest first. Ties break on id.
    pub fn ordered(&mut self) -> Arc<Vec<Conversation>> {
        self.drain_changes();
        if let Some(cached) = self.cached.as_ref() {
            return cached.clone();
        }
        let ordered = Arc::new(order_conversations(self.store.conversations()));
        self.cached = Some(ordered.clone());
        ordered
    }

    pub fn list(&mut self, filter: Option<&str>) -> Vec<Conversation> {
        let ordered = self.ordered();
        match filter {
            Some(text) => filter_conversations(&ordered, text),
            None => ordered.as_ref().clone(),
        }
    }

    pub fn total_unread(&mut self) -> u32 {
        self.ordered()
            .iter()
            .map(|c| c.unread_count)
            .fold(0u32, u32::saturating_add)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.store.subscribe()
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }
}

pub fn order_conversations(mut conversations: Vec<Conversation>) -> Vec<Conversation> {
    conversations.sort_by(|a, b| {
        b.last_activity_ms
            .cmp(&a.last_activity_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
    conversations
}

/// Case-insensitive substring match on participant or preview. A blank
/// filter keeps everything.
pub fn filter_conversations(conversations: &[Conversation], text: &str) -> Vec<Conversation> {
    let needle = text.trim().to_lowercase();
    if needle.is_empty() {
        return conversations.to_vec();
    }
    conversations
        .iter()
        .filter(|c| {
            c.participant_ref.to_lowercase().contains(&needle)
                || c.last_message_preview.to_lowercase().contains(&needle)
        })
        .cloned()
        .collect()
}
