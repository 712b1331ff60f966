use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub const ATTACHMENT_PREVIEW: &str = "[attachment]";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationId {
    pub value: String,
}

/// Identifier assigned by the server once a message is confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageId {
    pub value: String,
}

/// Identifier generated locally for an outgoing message. It is carried on
/// every send attempt and never regenerated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientId {
    pub value: Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentRef {
    pub value: String,
}

/// Opaque watermark handed out by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncCursor {
    pub value: String,
}

impl ConversationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl ClientId {
    pub fn random() -> Self {
        Self {
            value: Uuid::new_v4(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(|value| Self { value })
    }
}

impl AttachmentRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl SyncCursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn from_timestamp(ms: u64) -> Self {
        Self {
            value: ms.to_string(),
        }
    }
}

impl Display for ConversationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Delivered,
    Read,
}

impl MessageStatus {
    /// True once the server has acknowledged the message.
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
        )
    }

    fn confirmed_rank(&self) -> u8 {
        match self {
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            _ => 0,
        }
    }

    /// Status after applying `incoming` on top of `self`.
    ///
    /// Confirmed statuses only move forward (`Sent < Delivered < Read`), so a
    /// duplicated or reordered confirmation never downgrades a record. Any
    /// confirmed status replaces a local one.
    pub fn merge(self, incoming: MessageStatus) -> MessageStatus {
        match (self.is_confirmed(), incoming.is_confirmed()) {
            (true, true) => {
                if incoming.confirmed_rank() > self.confirmed_rank() {
                    incoming
                } else {
                    self
                }
            }
            (true, false) => self,
            (false, _) => incoming,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum SyncState {
    #[default]
    Fresh,
    /// Last reconciliation failed; local state is shown as stale.
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub server_id: Option<MessageId>,
    pub client_id: Option<ClientId>,
    pub conversation_id: ConversationId,
    pub direction: Direction,
    pub body: String,
    pub attachment_ref: Option<AttachmentRef>,
    pub created_at_ms: u64,
    pub status: MessageStatus,
    pub read_at_ms: Option<u64>,
}

impl Message {
    /// Tie-breaker used after `created_at_ms` when ordering a thread.
    pub fn ordering_id(&self) -> String {
        match (&self.server_id, &self.client_id) {
            (Some(id), _) => id.value.clone(),
            (None, Some(client)) => client.value.to_string(),
            (None, None) => String::new(),
        }
    }

    pub fn is_unread_incoming(&self) -> bool {
        self.direction == Direction::Incoming && self.read_at_ms.is_none()
    }

    pub fn preview(&self, max_chars: usize) -> String {
        preview_text(&self.body, self.attachment_ref.is_some(), max_chars)
    }
}

/// Message as confirmed by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerMessage {
    pub id: MessageId,
    pub client_id: Option<ClientId>,
    pub conversation_id: ConversationId,
    pub direction: Direction,
    pub body: String,
    pub attachment_ref: Option<AttachmentRef>,
    pub created_at_ms: u64,
    pub status: MessageStatus,
    pub read_at_ms: Option<u64>,
}

impl From<ServerMessage> for Message {
    fn from(value: ServerMessage) -> Self {
        Self {
            server_id: Some(value.id),
            client_id: value.client_id,
            conversation_id: value.conversation_id,
            direction: value.direction,
            body: value.body,
            attachment_ref: value.attachment_ref,
            created_at_ms: value.created_at_ms,
            status: value.status,
            read_at_ms: value.read_at_ms,
        }
    }
}

/// Delivery or read change reported for an already known message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusReceipt {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub client_id: Option<ClientId>,
    pub status: MessageStatus,
    pub read_at_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_ref: String,
    pub last_activity_ms: u64,
    pub unread_count: u32,
    pub last_message_preview: String,
    pub sync_state: SyncState,
}

/// Conversation metadata as listed by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationMeta {
    pub id: ConversationId,
    pub participant_ref: String,
    pub last_activity_ms: u64,
    pub last_message_preview: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationPage {
    pub conversations: Vec<ConversationMeta>,
    pub next_cursor: Option<SyncCursor>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessagePage {
    pub messages: Vec<ServerMessage>,
    pub next_cursor: Option<SyncCursor>,
}

/// Delta delivered by the live update source, polled or pushed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateBatch {
    #[serde(default)]
    pub conversations: Vec<ConversationMeta>,
    #[serde(default)]
    pub messages: Vec<ServerMessage>,
    #[serde(default)]
    pub receipts: Vec<StatusReceipt>,
    pub next_cursor: Option<SyncCursor>,
}

impl UpdateBatch {
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty() && self.messages.is_empty() && self.receipts.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageDraft {
    pub conversation_id: ConversationId,
    pub body: String,
    pub attachment_ref: Option<AttachmentRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationLimits {
    pub max_body_bytes: usize,
}

pub fn preview_text(body: &str, has_attachment: bool, max_chars: usize) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return if has_attachment {
            ATTACHMENT_PREVIEW.to_string()
        } else {
            String::new()
        };
    }
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}
