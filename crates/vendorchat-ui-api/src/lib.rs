use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const API_VERSION: u16 = 1;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiMeta {
    pub api_version: u16,
    pub request_id: Uuid,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse<T> {
    pub meta: ApiMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum SyncState {
    Fresh,
    Degraded,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConversationDto {
    pub id: String,
    pub participant: String,
    pub last_activity_ms: u64,
    pub unread_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    pub sync_state: SyncState,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConversationListDto {
    pub conversations: Vec<ConversationDto>,
    pub total_unread: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Delivered,
    Read,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub conversation_id: String,
    pub direction: Direction,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    pub created_ms: u64,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThreadDto {
    pub conversation: ConversationDto,
    pub messages: Vec<MessageDto>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SendMessageResponse {
    pub client_id: String,
    pub status: MessageStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MarkReadResponse {
    pub marked: usize,
}

/// Outcome of retry, cancel and close requests.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    pub changed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatsDto {
    pub conversations: usize,
    pub active_conversations: usize,
    pub degraded_conversations: usize,
    pub total_unread: u32,
    pub queued_deliveries: usize,
    pub in_flight_deliveries: usize,
    pub backing_off_deliveries: usize,
    pub failed_deliveries: usize,
}
