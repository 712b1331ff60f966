use crate::error::TransportError;
use crate::time::now_ms;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use vendorchat_api::{
    AttachmentRef, ClientId, ConversationId, ConversationMeta, ConversationPage, Direction,
    MessageId, MessagePage, MessageStatus, ServerMessage, StatusReceipt, SyncCursor, UpdateBatch,
    ATTACHMENT_PREVIEW,
};

/// Boundary to the messaging backend.
///
/// `send_message` must be safe to repeat with the same client id: the server
/// answers a duplicate with the message it already accepted.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_conversations(
        &self,
        cursor: Option<SyncCursor>,
    ) -> Result<ConversationPage, TransportError>;

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        since: Option<SyncCursor>,
    ) -> Result<MessagePage, TransportError>;

    async fn fetch_receipts(
        &self,
        conversation_id: &ConversationId,
        since: Option<SyncCursor>,
    ) -> Result<Vec<StatusReceipt>, TransportError>;

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        client_id: ClientId,
        body: &str,
        attachment_ref: Option<&AttachmentRef>,
    ) -> Result<ServerMessage, TransportError>;

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        up_to: &MessageId,
    ) -> Result<(), TransportError>;

    async fn fetch_updates_since(
        &self,
        cursor: Option<SyncCursor>,
    ) -> Result<UpdateBatch, TransportError>;

    /// Live update channel, when the backend pushes.
    fn subscribe_updates(&self) -> Option<broadcast::Receiver<UpdateBatch>> {
        None
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch_conversations: usize,
    pub fetch_messages: usize,
    pub fetch_receipts: usize,
    pub send_message: usize,
    pub mark_read: usize,
    pub fetch_updates: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendEvent {
    Started(ClientId),
    Finished(ClientId),
}

const DEFAULT_PAGE_SIZE: usize = 50;

/// In-memory backend. Every change is stamped with a sequence number and
/// cursors are those numbers rendered as strings.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockServer>>,
    push: Option<broadcast::Sender<UpdateBatch>>,
}

struct MockServer {
    seq: u64,
    clock_ms: u64,
    page_size: usize,
    conversations: HashMap<ConversationId, (u64, ConversationMeta)>,
    messages: Vec<(u64, ServerMessage)>,
    receipts: Vec<(u64, StatusReceipt)>,
    by_client: HashMap<ClientId, MessageId>,
    offline: bool,
    fail_sends: u32,
    lose_acks: u32,
    reject_cursors: bool,
    fetch_delay_ms: u64,
    send_delay_ms: u64,
    calls: CallCounts,
    send_events: Vec<SendEvent>,
    read_marks: Vec<(ConversationId, MessageId)>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self {
            seq: 0,
            clock_ms: 0,
            page_size: DEFAULT_PAGE_SIZE,
            conversations: HashMap::new(),
            messages: Vec::new(),
            receipts: Vec::new(),
            by_client: HashMap::new(),
            offline: false,
            fail_sends: 0,
            lose_acks: 0,
            reject_cursors: false,
            fetch_delay_ms: 0,
            send_delay_ms: 0,
            calls: CallCounts::default(),
            send_events: Vec::new(),
            read_marks: Vec::new(),
        }
    }
}

impl MockServer {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn next_timestamp(&mut self) -> u64 {
        self.clock_ms = now_ms().max(self.clock_ms + 1);
        self.clock_ms
    }

    fn cursor(&self) -> SyncCursor {
        SyncCursor::new(self.seq.to_string())
    }

    fn parse_since(&self, since: Option<&SyncCursor>) -> Result<u64, TransportError> {
        match since {
            None => Ok(0),
            Some(_) if self.reject_cursors => Err(TransportError::CursorRejected),
            Some(cursor) => cursor
                .value
                .parse::<u64>()
                .map_err(|_| TransportError::CursorRejected),
        }
    }

    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.offline {
            return Err(TransportError::Unavailable("offline".to_string()));
        }
        Ok(())
    }

    fn touch_conversation(&mut self, message: &ServerMessage) -> ConversationMeta {
        let seq = self.next_seq();
        let preview = if message.body.trim().is_empty() && message.attachment_ref.is_some() {
            ATTACHMENT_PREVIEW.to_string()
        } else {
            message.body.clone()
        };
        let entry = self
            .conversations
            .entry(message.conversation_id.clone())
            .or_insert_with(|| {
                (
                    seq,
                    ConversationMeta {
                        id: message.conversation_id.clone(),
                        participant_ref: message.conversation_id.value.clone(),
                        last_activity_ms: 0,
                        last_message_preview: None,
                    },
                )
            });
        entry.0 = seq;
        if message.created_at_ms >= entry.1.last_activity_ms {
            entry.1.last_activity_ms = message.created_at_ms;
            entry.1.last_message_preview = Some(preview);
        }
        entry.1.clone()
    }

    fn store_message(&mut self, message: ServerMessage) -> UpdateBatch {
        let seq = self.next_seq();
        if let Some(client_id) = message.client_id {
            self.by_client.insert(client_id, message.id.clone());
        }
        self.messages.push((seq, message.clone()));
        let meta = self.touch_conversation(&message);
        UpdateBatch {
            conversations: vec![meta],
            messages: vec![message],
            receipts: Vec::new(),
            next_cursor: Some(self.cursor()),
        }
    }

    fn advance(&mut self, id: &MessageId, status: MessageStatus) -> Option<StatusReceipt> {
        let read_at = match status {
            MessageStatus::Read => Some(self.next_timestamp()),
            _ => None,
        };
        let (_, message) = self.messages.iter_mut().find(|(_, m)| &m.id == id)?;
        let merged = message.status.merge(status);
        if merged == message.status {
            return None;
        }
        message.status = merged;
        if message.direction == Direction::Incoming && merged == MessageStatus::Read {
            message.read_at_ms = message.read_at_ms.or(read_at);
        }
        let receipt = StatusReceipt {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            client_id: message.client_id,
            status: merged,
            read_at_ms: message.read_at_ms.or(read_at),
        };
        let seq = self.next_seq();
        self.receipts.push((seq, receipt.clone()));
        Some(receipt)
    }

    fn updates_since(&self, since: u64) -> UpdateBatch {
        let mut conversations: Vec<(u64, ConversationMeta)> = self
            .conversations
            .values()
            .filter(|(seq, _)| *seq > since)
            .cloned()
            .collect();
        conversations.sort_by_key(|(seq, _)| *seq);
        UpdateBatch {
            conversations: conversations.into_iter().map(|(_, meta)| meta).collect(),
            messages: self
                .messages
                .iter()
                .filter(|(seq, _)| *seq > since)
                .map(|(_, m)| m.clone())
                .collect(),
            receipts: self
                .receipts
                .iter()
                .filter(|(seq, _)| *seq > since)
                .map(|(_, r)| r.clone())
                .collect(),
            next_cursor: Some(self.cursor()),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockServer::default())),
            push: None,
        }
    }

    /// Backend that also pushes every change on a broadcast channel.
    pub fn with_push(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(MockServer::default())),
            push: Some(tx),
        }
    }

    fn publish(&self, batch: UpdateBatch) {
        if let Some(tx) = self.push.as_ref() {
            let _ = tx.send(batch);
        }
    }

    pub async fn set_online(&self, online: bool) {
        self.inner.lock().await.offline = !online;
    }

    /// The next `count` sends fail before reaching the server.
    pub async fn fail_sends(&self, count: u32) {
        self.inner.lock().await.fail_sends = count;
    }

    /// The next `count` sends are stored but answered with an error.
    pub async fn lose_acks(&self, count: u32) {
        self.inner.lock().await.lose_acks = count;
    }

    pub async fn reject_cursors(&self, reject: bool) {
        self.inner.lock().await.reject_cursors = reject;
    }

    pub async fn set_fetch_delay(&self, delay_ms: u64) {
        self.inner.lock().await.fetch_delay_ms = delay_ms;
    }

    pub async fn set_send_delay(&self, delay_ms: u64) {
        self.inner.lock().await.send_delay_ms = delay_ms;
    }

    pub async fn set_page_size(&self, page_size: usize) {
        self.inner.lock().await.page_size = page_size.max(1);
    }

    pub async fn add_conversation(&self, id: &ConversationId, participant_ref: &str) -> ConversationMeta {
        let mut guard = self.inner.lock().await;
        let seq = guard.next_seq();
        let meta = ConversationMeta {
            id: id.clone(),
            participant_ref: participant_ref.to_string(),
            last_activity_ms: 0,
            last_message_preview: None,
        };
        guard.conversations.insert(id.clone(), (seq, meta.clone()));
        let batch = UpdateBatch {
            conversations: vec![meta.clone()],
            next_cursor: Some(guard.cursor()),
            ..UpdateBatch::default()
        };
        drop(guard);
        self.publish(batch);
        meta
    }

    /// Simulates a message from the other participant.
    pub async fn receive_incoming(&self, conversation_id: &ConversationId, body: &str) -> ServerMessage {
        let mut guard = self.inner.lock().await;
        let seq = guard.seq + 1;
        let message = ServerMessage {
            id: MessageId::new(format!("m-{}", seq)),
            client_id: None,
            conversation_id: conversation_id.clone(),
            direction: Direction::Incoming,
            body: body.to_string(),
            attachment_ref: None,
            created_at_ms: guard.next_timestamp(),
            status: MessageStatus::Delivered,
            read_at_ms: None,
        };
        let batch = guard.store_message(message.clone());
        drop(guard);
        self.publish(batch);
        message
    }

    /// Records delivery to the recipient of a previously accepted message.
    pub async fn mark_delivered(&self, client_id: &ClientId) -> Option<StatusReceipt> {
        self.advance_client(client_id, MessageStatus::Delivered).await
    }

    /// Records that the recipient read a previously accepted message.
    pub async fn mark_seen(&self, client_id: &ClientId) -> Option<StatusReceipt> {
        self.advance_client(client_id, MessageStatus::Read).await
    }

    async fn advance_client(&self, client_id: &ClientId, status: MessageStatus) -> Option<StatusReceipt> {
        let mut guard = self.inner.lock().await;
        let id = guard.by_client.get(client_id).cloned()?;
        let receipt = guard.advance(&id, status)?;
        let batch = UpdateBatch {
            receipts: vec![receipt.clone()],
            next_cursor: Some(guard.cursor()),
            ..UpdateBatch::default()
        };
        drop(guard);
        self.publish(batch);
        Some(receipt)
    }

    pub async fn calls(&self) -> CallCounts {
        self.inner.lock().await.calls
    }

    pub async fn send_events(&self) -> Vec<SendEvent> {
        self.inner.lock().await.send_events.clone()
    }

    pub async fn read_marks(&self) -> Vec<(ConversationId, MessageId)> {
        self.inner.lock().await.read_marks.clone()
    }

    /// Outgoing messages the server has accepted, in acceptance order.
    pub async fn accepted(&self) -> Vec<ServerMessage> {
        self.inner
            .lock()
            .await
            .messages
            .iter()
            .filter(|(_, m)| m.direction == Direction::Outgoing)
            .map(|(_, m)| m.clone())
            .collect()
    }

    async fn fetch_delay(&self) {
        let delay = self.inner.lock().await.fetch_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_conversations(
        &self,
        cursor: Option<SyncCursor>,
    ) -> Result<ConversationPage, TransportError> {
        self.fetch_delay().await;
        let mut guard = self.inner.lock().await;
        guard.calls.fetch_conversations += 1;
        guard.ensure_online()?;
        let offset = match cursor {
            None => 0,
            Some(cursor) => cursor
                .value
                .parse::<usize>()
                .map_err(|_| TransportError::CursorRejected)?,
        };
        let mut all: Vec<ConversationMeta> =
            guard.conversations.values().map(|(_, m)| m.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let end = (offset + guard.page_size).min(all.len());
        let conversations = all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = if end < all.len() {
            Some(SyncCursor::new(end.to_string()))
        } else {
            None
        };
        Ok(ConversationPage {
            conversations,
            next_cursor,
        })
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        since: Option<SyncCursor>,
    ) -> Result<MessagePage, TransportError> {
        self.fetch_delay().await;
        let mut guard = self.inner.lock().await;
        guard.calls.fetch_messages += 1;
        guard.ensure_online()?;
        let since = guard.parse_since(since.as_ref())?;
        let messages = guard
            .messages
            .iter()
            .filter(|(seq, m)| *seq > since && &m.conversation_id == conversation_id)
            .map(|(_, m)| m.clone())
            .collect();
        Ok(MessagePage {
            messages,
            next_cursor: Some(guard.cursor()),
        })
    }

    async fn fetch_receipts(
        &self,
        conversation_id: &ConversationId,
        since: Option<SyncCursor>,
    ) -> Result<Vec<StatusReceipt>, TransportError> {
        let mut guard = self.inner.lock().await;
        guard.calls.fetch_receipts += 1;
        guard.ensure_online()?;
        let since = guard.parse_since(since.as_ref())?;
        Ok(guard
            .receipts
            .iter()
            .filter(|(seq, r)| *seq > since && &r.conversation_id == conversation_id)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        client_id: ClientId,
        body: &str,
        attachment_ref: Option<&AttachmentRef>,
    ) -> Result<ServerMessage, TransportError> {
        let delay = {
            let mut guard = self.inner.lock().await;
            guard.calls.send_message += 1;
            guard.send_events.push(SendEvent::Started(client_id));
            guard.send_delay_ms
        };
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut guard = self.inner.lock().await;
        guard.send_events.push(SendEvent::Finished(client_id));
        guard.ensure_online()?;
        if guard.fail_sends > 0 {
            guard.fail_sends -= 1;
            return Err(TransportError::Unavailable("send failed".to_string()));
        }
        let existing = guard.by_client.get(&client_id).cloned();
        if let Some(id) = existing {
            if let Some((_, message)) = guard.messages.iter().find(|(_, m)| m.id == id) {
                return Ok(message.clone());
            }
        }
        let message = ServerMessage {
            id: MessageId::new(format!("m-{}", guard.seq + 1)),
            client_id: Some(client_id),
            conversation_id: conversation_id.clone(),
            direction: Direction::Outgoing,
            body: body.to_string(),
            attachment_ref: attachment_ref.cloned(),
            created_at_ms: guard.next_timestamp(),
            status: MessageStatus::Sent,
            read_at_ms: None,
        };
        let batch = guard.store_message(message.clone());
        let lost = guard.lose_acks > 0;
        if lost {
            guard.lose_acks -= 1;
        }
        drop(guard);
        self.publish(batch);
        if lost {
            return Err(TransportError::Unavailable("ack lost".to_string()));
        }
        Ok(message)
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        up_to: &MessageId,
    ) -> Result<(), TransportError> {
        let mut guard = self.inner.lock().await;
        guard.calls.mark_read += 1;
        guard.ensure_online()?;
        let Some(last) = guard
            .messages
            .iter()
            .position(|(_, m)| &m.id == up_to && &m.conversation_id == conversation_id)
        else {
            return Err(TransportError::Rejected(format!("unknown message {}", up_to)));
        };
        let targets: Vec<MessageId> = guard.messages[..=last]
            .iter()
            .filter(|(_, m)| {
                &m.conversation_id == conversation_id
                    && m.direction == Direction::Incoming
                    && m.read_at_ms.is_none()
            })
            .map(|(_, m)| m.id.clone())
            .collect();
        let receipts: Vec<StatusReceipt> = targets
            .iter()
            .filter_map(|id| guard.advance(id, MessageStatus::Read))
            .collect();
        guard
            .read_marks
            .push((conversation_id.clone(), up_to.clone()));
        let batch = UpdateBatch {
            receipts,
            next_cursor: Some(guard.cursor()),
            ..UpdateBatch::default()
        };
        drop(guard);
        if !batch.is_empty() {
            self.publish(batch);
        }
        Ok(())
    }

    async fn fetch_updates_since(
        &self,
        cursor: Option<SyncCursor>,
    ) -> Result<UpdateBatch, TransportError> {
        self.fetch_delay().await;
        let mut guard = self.inner.lock().await;
        guard.calls.fetch_updates += 1;
        guard.ensure_online()?;
        let since = guard.parse_since(cursor.as_ref())?;
        Ok(guard.updates_since(since))
    }

    fn subscribe_updates(&self) -> Option<broadcast::Receiver<UpdateBatch>> {
        self.push.as_ref().map(|tx| tx.subscribe())
    }
}
