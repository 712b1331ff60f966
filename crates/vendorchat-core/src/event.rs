use tokio::sync::broadcast;
use vendorchat_api::{ClientId, ConversationId, MessageId, MessageStatus};

/// Change notification published by the message store after every mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    ConversationChanged(ConversationId),
    MessageChanged {
        conversation_id: ConversationId,
        client_id: Option<ClientId>,
        server_id: Option<MessageId>,
        status: MessageStatus,
    },
    MessageRemoved {
        conversation_id: ConversationId,
        client_id: ClientId,
    },
}

impl StoreEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            StoreEvent::ConversationChanged(id) => id,
            StoreEvent::MessageChanged {
                conversation_id, ..
            } => conversation_id,
            StoreEvent::MessageRemoved {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// Dropping the receiver unsubscribes.
pub type EventReceiver = broadcast::Receiver<StoreEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }
}
