pub mod delivery_tests;

use crate::config::CoreConfig;
use crate::event::EventBus;
use crate::policy::Policy;
use crate::store::MessageStore;
use crate::Core;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use vendorchat_api::{
    ClientId, ConversationId, Direction, MessageId, MessageStatus, ServerMessage,
};

pub fn quiet_config() -> CoreConfig {
    CoreConfig {
        polling_interval_ms: 0,
        conversation_poll_interval_ms: 0,
        prefer_push: false,
        ..CoreConfig::default()
    }
}

pub fn fast_policy() -> Policy {
    Policy {
        backoff_initial_ms: 5,
        backoff_max_ms: 20,
        backoff_jitter_ms: 0,
        ..Policy::default()
    }
}

pub fn conv(id: &str) -> ConversationId {
    ConversationId::new(id)
}

pub fn new_store() -> MessageStore {
    MessageStore::new(EventBus::new(64), 16)
}

pub fn incoming(conversation: &str, id: &str, created_at_ms: u64, body: &str) -> ServerMessage {
    ServerMessage {
        id: MessageId::new(id),
        client_id: None,
        conversation_id: conv(conversation),
        direction: Direction::Incoming,
        body: body.to_string(),
        attachment_ref: None,
        created_at_ms,
        status: MessageStatus::Delivered,
        read_at_ms: None,
    }
}

pub fn confirmed(
    conversation: &str,
    id: &str,
    client_id: ClientId,
    created_at_ms: u64,
    status: MessageStatus,
) -> ServerMessage {
    ServerMessage {
        id: MessageId::new(id),
        client_id: Some(client_id),
        conversation_id: conv(conversation),
        direction: Direction::Outgoing,
        body: "hello".to_string(),
        attachment_ref: None,
        created_at_ms,
        status,
        read_at_ms: None,
    }
}

pub async fn core_with(
    transport: &crate::messaging::MockTransport,
    config: CoreConfig,
    policy: Policy,
) -> Core {
    Core::init(config, policy, Arc::new(transport.clone()))
        .await
        .expect("core init")
}

pub async fn wait_until<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Polls the core until the message reaches `status` or two seconds pass.
pub async fn wait_for_status(
    core: &Core,
    conversation: &ConversationId,
    client_id: &ClientId,
    status: MessageStatus,
) -> bool {
    wait_until(|| {
        core.snapshot(conversation)
            .ok()
            .and_then(|s| s.find_by_client(client_id).map(|m| m.status))
            == Some(status)
    })
    .await
}
