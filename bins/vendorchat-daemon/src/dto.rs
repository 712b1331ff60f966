use vendorchat_api::{Conversation, Direction, Message, MessageStatus, SyncState};
use vendorchat_core::store::ConversationSnapshot;
use vendorchat_core::CoreStats;
use vendorchat_ui_api as ui;

pub fn conversation_dto(conversation: &Conversation) -> ui::ConversationDto {
    ui::ConversationDto {
        id: conversation.id.value.clone(),
        participant: conversation.participant_ref.clone(),
        last_activity_ms: conversation.last_activity_ms,
        unread_count: conversation.unread_count,
        last_message_preview: Some(conversation.last_message_preview.clone())
            .filter(|p| !p.is_empty()),
        sync_state: match conversation.sync_state {
            SyncState::Fresh => ui::SyncState::Fresh,
            SyncState::Degraded => ui::SyncState::Degraded,
        },
    }
}

pub fn status_dto(status: MessageStatus) -> ui::MessageStatus {
    match status {
        MessageStatus::Pending => ui::MessageStatus::Pending,
        MessageStatus::Sending => ui::MessageStatus::Sending,
        MessageStatus::Sent => ui::MessageStatus::Sent,
        MessageStatus::Failed => ui::MessageStatus::Failed,
        MessageStatus::Delivered => ui::MessageStatus::Delivered,
        MessageStatus::Read => ui::MessageStatus::Read,
    }
}

pub fn message_dto(message: &Message) -> ui::MessageDto {
    ui::MessageDto {
        id: message.server_id.as_ref().map(|id| id.value.clone()),
        client_id: message.client_id.map(|id| id.to_string()),
        conversation_id: message.conversation_id.value.clone(),
        direction: match message.direction {
            Direction::Incoming => ui::Direction::Incoming,
            Direction::Outgoing => ui::Direction::Outgoing,
        },
        body: message.body.clone(),
        attachment_ref: message.attachment_ref.as_ref().map(|a| a.value.clone()),
        created_ms: message.created_at_ms,
        status: status_dto(message.status),
        read_ms: message.read_at_ms,
    }
}

pub fn thread_dto(snapshot: &ConversationSnapshot) -> ui::ThreadDto {
    ui::ThreadDto {
        conversation: conversation_dto(&snapshot.conversation),
        messages: snapshot.iter().map(message_dto).collect(),
    }
}

pub fn stats_dto(stats: &CoreStats) -> ui::StatsDto {
    ui::StatsDto {
        conversations: stats.conversations,
        active_conversations: stats.active_conversations,
        degraded_conversations: stats.degraded_conversations,
        total_unread: stats.total_unread,
        queued_deliveries: stats.queued_deliveries,
        in_flight_deliveries: stats.in_flight_deliveries,
        backing_off_deliveries: stats.backing_off_deliveries,
        failed_deliveries: stats.failed_deliveries,
    }
}
