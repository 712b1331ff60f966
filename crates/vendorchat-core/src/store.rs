//! In-memory cache of conversations and their ordered threads.
//!
//! The store is the single source of truth the UI renders from. All
//! mutations go through one writer lock and publish a [`StoreEvent`] once the
//! lock is released; readers get immutable snapshots that share the thread
//! vector with the store until the next write (copy-on-write).

use crate::error::CoreError;
use crate::event::{EventBus, EventReceiver, StoreEvent};
use crate::time::now_ms;
use log::debug;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use vendorchat_api::{
    ClientId, Conversation, ConversationId, ConversationMeta, Direction, Message, MessageDraft,
    MessageId, MessageStatus, ServerMessage, StatusReceipt, SyncState,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Clone)]
pub struct MessageStore {
    state: Arc<RwLock<StoreState>>,
    events: EventBus,
    preview_max_chars: usize,
}

#[derive(Default)]
struct StoreState {
    threads: HashMap<ConversationId, Thread>,
    client_index: HashMap<ClientId, ConversationId>,
}

struct Thread {
    conversation: Conversation,
    messages: Arc<Vec<Message>>,
    /// Activity and preview last reported by the server list.
    listed: Option<(u64, String)>,
}

enum Merge {
    Inserted,
    Updated,
    Unchanged,
}

impl Thread {
    fn new(id: ConversationId, participant_ref: String) -> Self {
        Self {
            conversation: Conversation {
                id,
                participant_ref,
                last_activity_ms: 0,
                unread_count: 0,
                last_message_preview: String::new(),
                sync_state: SyncState::Fresh,
            },
            messages: Arc::new(Vec::new()),
            listed: None,
        }
    }

    fn position(&self, client_id: Option<&ClientId>, server_id: Option<&MessageId>) -> Option<usize> {
        client_id
            .and_then(|c| self.messages.iter().position(|m| m.client_id.as_ref() == Some(c)))
            .or_else(|| {
                server_id.and_then(|s| {
                    self.messages
                        .iter()
                        .position(|m| m.server_id.as_ref() == Some(s))
                })
            })
    }

    fn merge_server(&mut self, incoming: ServerMessage) -> Merge {
        let position = self.position(incoming.client_id.as_ref(), Some(&incoming.id));
        let messages = Arc::make_mut(&mut self.messages);
        let Some(idx) = position else {
            messages.push(incoming.into());
            return Merge::Inserted;
        };
        let existing = &mut messages[idx];
        let before = existing.clone();
        if !existing.status.is_confirmed() {
            // First confirmation: the server timestamp replaces the estimate.
            existing.created_at_ms = incoming.created_at_ms;
        }
        if existing.server_id.is_none() {
            existing.server_id = Some(incoming.id);
        }
        if existing.client_id.is_none() {
            existing.client_id = incoming.client_id;
        }
        existing.direction = incoming.direction;
        existing.body = incoming.body;
        existing.attachment_ref = incoming.attachment_ref;
        existing.status = existing.status.merge(incoming.status);
        existing.read_at_ms = incoming.read_at_ms.or(existing.read_at_ms);
        if *existing == before {
            Merge::Unchanged
        } else {
            Merge::Updated
        }
    }

    fn sort(&mut self) {
        let in_order = self
            .messages
            .windows(2)
            .all(|pair| compare_messages(&pair[0], &pair[1]) != Ordering::Greater);
        if !in_order {
            Arc::make_mut(&mut self.messages).sort_by(compare_messages);
        }
    }

    fn refresh_summary(&mut self, preview_max_chars: usize) {
        let unread = self
            .messages
            .iter()
            .filter(|m| m.is_unread_incoming())
            .count();
        self.conversation.unread_count = u32::try_from(unread).unwrap_or(u32::MAX);
        if let Some(last) = self.messages.last() {
            if last.created_at_ms >= self.conversation.last_activity_ms {
                self.conversation.last_activity_ms = last.created_at_ms;
                self.conversation.last_message_preview = last.preview(preview_max_chars);
            }
        }
    }

    /// Recomputes activity and preview from scratch after a record was
    /// removed: the newest remaining message, else the server listing.
    fn rebuild_summary(&mut self, preview_max_chars: usize) {
        let (activity, preview) = self.listed.clone().unwrap_or_default();
        self.conversation.last_activity_ms = activity;
        self.conversation.last_message_preview = preview;
        self.refresh_summary(preview_max_chars);
    }
}

fn compare_messages(a: &Message, b: &Message) -> Ordering {
    a.created_at_ms
        .cmp(&b.created_at_ms)
        .then_with(|| a.ordering_id().cmp(&b.ordering_id()))
}

fn message_event(message: &Message) -> StoreEvent {
    StoreEvent::MessageChanged {
        conversation_id: message.conversation_id.clone(),
        client_id: message.client_id,
        server_id: message.server_id.clone(),
        status: message.status,
    }
}

fn missing_conversation(id: &ConversationId) -> CoreError {
    CoreError::NotFound(format!("conversation {}", id))
}

impl MessageStore {
    pub fn new(events: EventBus, preview_max_chars: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            events,
            preview_max_chars,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_all(&self, events: Vec<StoreEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.read().threads.contains_key(id)
    }

    /// Creates the conversation if it is unknown. Returns true when created.
    pub fn ensure_conversation(&self, id: &ConversationId, participant_ref: &str) -> bool {
        {
            let mut guard = self.write();
            if guard.threads.contains_key(id) {
                return false;
            }
            guard.threads.insert(
                id.clone(),
                Thread::new(id.clone(), participant_ref.to_string()),
            );
        }
        debug!("conversation {} created locally", id);
        self.events
            .publish(StoreEvent::ConversationChanged(id.clone()));
        true
    }

    /// Applies list metadata from the server. Last activity never moves
    /// backwards and the unread count stays derived from local messages.
    pub fn apply_conversation_meta(&self, meta: &ConversationMeta) {
        let changed = {
            let mut guard = self.write();
            let thread = guard
                .threads
                .entry(meta.id.clone())
                .or_insert_with(|| Thread::new(meta.id.clone(), meta.participant_ref.clone()));
            let before = thread.conversation.clone();
            if !meta.participant_ref.is_empty() {
                thread.conversation.participant_ref = meta.participant_ref.clone();
            }
            let listed_preview = meta
                .last_message_preview
                .as_deref()
                .map(|p| vendorchat_api::preview_text(p, false, self.preview_max_chars));
            if meta.last_activity_ms > thread.listed.as_ref().map_or(0, |(at, _)| *at) {
                thread.listed = Some((
                    meta.last_activity_ms,
                    listed_preview.clone().unwrap_or_default(),
                ));
            }
            if meta.last_activity_ms > thread.conversation.last_activity_ms {
                thread.conversation.last_activity_ms = meta.last_activity_ms;
                if let Some(preview) = listed_preview {
                    thread.conversation.last_message_preview = preview;
                }
            }
            thread.conversation != before
        };
        if changed {
            self.events
                .publish(StoreEvent::ConversationChanged(meta.id.clone()));
        }
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.read()
            .threads
            .get(id)
            .map(|t| t.conversation.clone())
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.read()
            .threads
            .values()
            .map(|t| t.conversation.clone())
            .collect()
    }

    pub fn snapshot(&self, id: &ConversationId) -> Result<ConversationSnapshot, CoreError> {
        let guard = self.read();
        let thread = guard.threads.get(id).ok_or_else(|| missing_conversation(id))?;
        Ok(ConversationSnapshot {
            conversation: thread.conversation.clone(),
            messages: thread.messages.clone(),
        })
    }

    pub fn find_by_client(&self, client_id: &ClientId) -> Option<Message> {
        let guard = self.read();
        let conversation_id = guard.client_index.get(client_id)?;
        guard
            .threads
            .get(conversation_id)?
            .messages
            .iter()
            .find(|m| m.client_id.as_ref() == Some(client_id))
            .cloned()
    }

    /// Adds a `Pending` outgoing record with a fresh client id and an
    /// estimated timestamp, for optimistic rendering. The estimate is kept
    /// after the thread's newest message so drafts render in send order.
    pub fn append_outgoing(&self, draft: &MessageDraft) -> Result<Message, CoreError> {
        let message = {
            let mut guard = self.write();
            let thread = guard
                .threads
                .get_mut(&draft.conversation_id)
                .ok_or_else(|| missing_conversation(&draft.conversation_id))?;
            let newest = thread.messages.last().map(|m| m.created_at_ms + 1);
            let message = Message {
                server_id: None,
                client_id: Some(ClientId::random()),
                conversation_id: draft.conversation_id.clone(),
                direction: Direction::Outgoing,
                body: draft.body.clone(),
                attachment_ref: draft.attachment_ref.clone(),
                created_at_ms: now_ms().max(newest.unwrap_or(0)),
                status: MessageStatus::Pending,
                read_at_ms: None,
            };
            Arc::make_mut(&mut thread.messages).push(message.clone());
            thread.sort();
            thread.refresh_summary(self.preview_max_chars);
            if let Some(client_id) = message.client_id {
                guard
                    .client_index
                    .insert(client_id, draft.conversation_id.clone());
            }
            message
        };
        self.publish_all(vec![
            message_event(&message),
            StoreEvent::ConversationChanged(draft.conversation_id.clone()),
        ]);
        Ok(message)
    }

    /// Merges a batch of server-confirmed messages.
    ///
    /// A message sharing a client id with an existing record replaces that
    /// record in place, otherwise it is matched by server id, otherwise it is
    /// inserted. Local records absent from the batch are left untouched.
    pub fn upsert_messages(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<ServerMessage>,
    ) -> Result<UpsertOutcome, CoreError> {
        let mut outcome = UpsertOutcome::default();
        let mut events = Vec::new();
        {
            let mut guard = self.write();
            let state = &mut *guard;
            let thread = state
                .threads
                .get_mut(conversation_id)
                .ok_or_else(|| missing_conversation(conversation_id))?;
            for incoming in messages {
                if &incoming.conversation_id != conversation_id {
                    debug!(
                        "skipping message {} addressed to {}",
                        incoming.id, incoming.conversation_id
                    );
                    continue;
                }
                let client_id = incoming.client_id;
                let server_id = incoming.id.clone();
                match thread.merge_server(incoming) {
                    Merge::Inserted => outcome.inserted += 1,
                    Merge::Updated => outcome.updated += 1,
                    Merge::Unchanged => continue,
                }
                if let Some(client_id) = client_id {
                    state
                        .client_index
                        .insert(client_id, conversation_id.clone());
                }
                if let Some(idx) = thread.position(client_id.as_ref(), Some(&server_id)) {
                    events.push(message_event(&thread.messages[idx]));
                }
            }
            if !events.is_empty() {
                thread.sort();
                thread.refresh_summary(self.preview_max_chars);
                events.push(StoreEvent::ConversationChanged(conversation_id.clone()));
            }
        }
        self.publish_all(events);
        Ok(outcome)
    }

    /// Applies delivery/read deltas. Returns the number of records changed;
    /// receipts for unknown messages are skipped.
    pub fn apply_receipts(
        &self,
        conversation_id: &ConversationId,
        receipts: &[StatusReceipt],
    ) -> Result<usize, CoreError> {
        let mut events = Vec::new();
        {
            let mut guard = self.write();
            let thread = guard
                .threads
                .get_mut(conversation_id)
                .ok_or_else(|| missing_conversation(conversation_id))?;
            for receipt in receipts {
                let Some(idx) =
                    thread.position(receipt.client_id.as_ref(), Some(&receipt.message_id))
                else {
                    debug!("receipt for unknown message {}", receipt.message_id);
                    continue;
                };
                let messages = Arc::make_mut(&mut thread.messages);
                let record = &mut messages[idx];
                let before = record.clone();
                record.status = record.status.merge(receipt.status);
                if record.direction == Direction::Incoming
                    && receipt.status == MessageStatus::Read
                    && record.read_at_ms.is_none()
                {
                    record.read_at_ms = Some(receipt.read_at_ms.unwrap_or_else(now_ms));
                }
                if *record != before {
                    events.push(message_event(record));
                }
            }
            if !events.is_empty() {
                thread.refresh_summary(self.preview_max_chars);
                events.push(StoreEvent::ConversationChanged(conversation_id.clone()));
            }
        }
        let changed = events.len().saturating_sub(1);
        self.publish_all(events);
        Ok(changed)
    }

    /// Marks every unread incoming message up to and including `up_to` as
    /// read. Returns how many records changed.
    pub fn mark_read(
        &self,
        conversation_id: &ConversationId,
        up_to: &MessageId,
    ) -> Result<usize, CoreError> {
        let mut events = Vec::new();
        {
            let mut guard = self.write();
            let thread = guard
                .threads
                .get_mut(conversation_id)
                .ok_or_else(|| missing_conversation(conversation_id))?;
            let last = thread
                .position(None, Some(up_to))
                .ok_or_else(|| CoreError::NotFound(format!("message {}", up_to)))?;
            let now = now_ms();
            let messages = Arc::make_mut(&mut thread.messages);
            for record in messages[..=last].iter_mut() {
                if record.is_unread_incoming() {
                    record.read_at_ms = Some(now);
                    events.push(message_event(record));
                }
            }
            if !events.is_empty() {
                thread.refresh_summary(self.preview_max_chars);
                events.push(StoreEvent::ConversationChanged(conversation_id.clone()));
            }
        }
        let changed = events.len().saturating_sub(1);
        self.publish_all(events);
        Ok(changed)
    }

    /// Server id of the newest incoming message in the thread.
    pub fn latest_incoming(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<MessageId>, CoreError> {
        let guard = self.read();
        let thread = guard
            .threads
            .get(conversation_id)
            .ok_or_else(|| missing_conversation(conversation_id))?;
        Ok(thread
            .messages
            .iter()
            .rev()
            .filter(|m| m.direction == Direction::Incoming)
            .find_map(|m| m.server_id.clone()))
    }

    /// Records a delivery-queue transition. Ignored (returns false) once the
    /// server has confirmed the message.
    pub fn set_local_status(
        &self,
        client_id: &ClientId,
        status: MessageStatus,
    ) -> Result<bool, CoreError> {
        let event = {
            let mut guard = self.write();
            let state = &mut *guard;
            let conversation_id = state
                .client_index
                .get(client_id)
                .ok_or_else(|| CoreError::NotFound(format!("message {}", client_id)))?;
            let thread = state
                .threads
                .get_mut(conversation_id)
                .ok_or_else(|| missing_conversation(conversation_id))?;
            let idx = thread
                .position(Some(client_id), None)
                .ok_or_else(|| CoreError::NotFound(format!("message {}", client_id)))?;
            let current = thread.messages[idx].status;
            if current.is_confirmed() || current == status {
                return Ok(false);
            }
            let messages = Arc::make_mut(&mut thread.messages);
            messages[idx].status = status;
            message_event(&messages[idx])
        };
        self.events.publish(event);
        Ok(true)
    }

    /// Removes an outgoing record the server never confirmed. Returns false
    /// and keeps the record when it is already confirmed.
    pub fn discard_unsent(&self, client_id: &ClientId) -> Result<bool, CoreError> {
        let conversation_id = {
            let mut guard = self.write();
            let state = &mut *guard;
            let conversation_id = state
                .client_index
                .get(client_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("message {}", client_id)))?;
            let thread = state
                .threads
                .get_mut(&conversation_id)
                .ok_or_else(|| missing_conversation(&conversation_id))?;
            let idx = thread
                .position(Some(client_id), None)
                .ok_or_else(|| CoreError::NotFound(format!("message {}", client_id)))?;
            if thread.messages[idx].status.is_confirmed() {
                return Ok(false);
            }
            Arc::make_mut(&mut thread.messages).remove(idx);
            thread.rebuild_summary(self.preview_max_chars);
            state.client_index.remove(client_id);
            conversation_id
        };
        self.publish_all(vec![
            StoreEvent::MessageRemoved {
                conversation_id: conversation_id.clone(),
                client_id: *client_id,
            },
            StoreEvent::ConversationChanged(conversation_id),
        ]);
        Ok(true)
    }

    pub fn set_sync_state(&self, id: &ConversationId, sync_state: SyncState) -> Result<(), CoreError> {
        {
            let mut guard = self.write();
            let thread = guard
                .threads
                .get_mut(id)
                .ok_or_else(|| missing_conversation(id))?;
            if thread.conversation.sync_state == sync_state {
                return Ok(());
            }
            thread.conversation.sync_state = sync_state;
        }
        self.events
            .publish(StoreEvent::ConversationChanged(id.clone()));
        Ok(())
    }

    pub fn unread_total(&self) -> u32 {
        self.read()
            .threads
            .values()
            .map(|t| t.conversation.unread_count)
            .fold(0u32, u32::saturating_add)
    }

    pub fn degraded_count(&self) -> usize {
        self.read()
            .threads
            .values()
            .filter(|t| t.conversation.sync_state == SyncState::Degraded)
            .count()
    }
}

/// Immutable view of one conversation, detached from later writes.
#[derive(Clone, Debug)]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    messages: Arc<Vec<Message>>,
}

impl ConversationSnapshot {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn find_by_client(&self, client_id: &ClientId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.client_id.as_ref() == Some(client_id))
    }
}

impl<'a> IntoIterator for &'a ConversationSnapshot {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

impl IntoIterator for ConversationSnapshot {
    type Item = Message;
    type IntoIter = MessageIter;

    fn into_iter(self) -> Self::IntoIter {
        MessageIter {
            messages: self.messages,
            next: 0,
        }
    }
}

/// Owning iterator over a snapshot's messages.
pub struct MessageIter {
    messages: Arc<Vec<Message>>,
    next: usize,
}

impl MessageIter {
    pub(crate) fn empty() -> Self {
        Self {
            messages: Arc::new(Vec::new()),
            next: 0,
        }
    }
}

impl Iterator for MessageIter {
    type Item = Message;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.messages.get(self.next).cloned();
        if item.is_some() {
            self.next += 1;
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.messages.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}
