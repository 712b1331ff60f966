pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
pub mod index;
mod introspection;
pub mod messaging;
pub mod policy;
pub mod store;
pub mod sync;
pub mod time;

pub use introspection::CoreStats;

use config::CoreConfig;
use delivery::{DeliveryQueue, DeliveryState};
use error::CoreError;
use event::{EventBus, EventReceiver};
use index::ConversationIndex;
use log::{info, warn};
use messaging::Transport;
use policy::Policy;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use store::{ConversationSnapshot, MessageIter, MessageStore};
use sync::{PassTicket, SyncEngine};
use tokio::task::JoinHandle;
use vendorchat_api::{AttachmentRef, ClientId, Conversation, ConversationId, MessageDraft};

#[derive(Clone)]
pub struct Core {
    config: CoreConfig,
    policy: Policy,
    store: MessageStore,
    delivery: DeliveryQueue,
    sync: SyncEngine,
    index: Arc<Mutex<ConversationIndex>>,
    transport: Arc<dyn Transport>,
    listener: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Core {
    pub async fn init(
        config: CoreConfig,
        policy: Policy,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CoreError> {
        let store = MessageStore::new(
            EventBus::new(config.event_capacity),
            config.preview_max_chars,
        );
        let sync = SyncEngine::new(store.clone(), transport.clone(), config.clone());
        let delivery = DeliveryQueue::new(
            store.clone(),
            transport.clone(),
            policy.clone(),
            Some(sync.clone()),
        );
        let core = Self {
            config: config.clone(),
            policy,
            index: Arc::new(Mutex::new(ConversationIndex::new(store.clone()))),
            store,
            delivery,
            sync,
            transport,
            listener: Arc::new(Mutex::new(None)),
        };
        let listener = core.sync.start_update_listener();
        *core.listener_guard() = listener;
        match core.refresh_conversations().await {
            Ok(count) => info!("core ready with {} conversations", count),
            Err(err) => warn!("initial conversation refresh failed: {}", err),
        }
        Ok(core)
    }

    fn listener_guard(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_guard(&self) -> MutexGuard<'_, ConversationIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.store.subscribe()
    }

    /// Conversations by last activity, optionally filtered by participant or
    /// preview text.
    pub fn list_conversations(&self, filter: Option<&str>) -> Vec<Conversation> {
        self.index_guard().list(filter)
    }

    pub fn total_unread(&self) -> u32 {
        self.index_guard().total_unread()
    }

    pub async fn refresh_conversations(&self) -> Result<usize, CoreError> {
        self.sync.refresh_conversations().await
    }

    pub async fn poll_updates(&self) -> Result<usize, CoreError> {
        self.sync.poll_updates().await
    }

    /// Activates the conversation and starts a reconciliation pass.
    pub fn open_conversation(&self, id: &ConversationId) -> Result<ConversationView, CoreError> {
        vendorchat_api::validate_conversation_id(id)?;
        let ticket = self.sync.open(id);
        Ok(ConversationView {
            id: id.clone(),
            store: self.store.clone(),
            sync: self.sync.clone(),
            ticket,
        })
    }

    pub fn close_conversation(&self, id: &ConversationId) -> bool {
        self.sync.close(id)
    }

    /// Runs a pass for an open conversation and waits for it. False when the
    /// conversation is not open.
    pub async fn sync_conversation(&self, id: &ConversationId) -> bool {
        self.sync.sync_now(id).await
    }

    /// Validates and queues a message. The conversation is created locally
    /// if this is the first message to it.
    pub fn send_message(
        &self,
        conversation_id: &ConversationId,
        body: &str,
        attachment_ref: Option<AttachmentRef>,
    ) -> Result<ClientId, CoreError> {
        let draft = MessageDraft {
            conversation_id: conversation_id.clone(),
            body: body.to_string(),
            attachment_ref,
        };
        vendorchat_api::validate_draft(&draft, &self.policy.validation_limits())?;
        self.store
            .ensure_conversation(conversation_id, &conversation_id.value);
        let message = self.delivery.enqueue(&draft)?;
        message
            .client_id
            .ok_or_else(|| CoreError::NotFound("client id".to_string()))
    }

    pub fn retry_message(&self, client_id: &ClientId) -> Result<bool, CoreError> {
        self.delivery.retry(client_id)
    }

    /// Abandons an unconfirmed message and removes it from the thread. A
    /// message whose send is on the wire is left alone.
    pub fn cancel_message(&self, client_id: &ClientId) -> Result<bool, CoreError> {
        if !self.delivery.cancel(client_id) && self.delivery.state(client_id).is_some() {
            return Ok(false);
        }
        self.store.discard_unsent(client_id)
    }

    /// Marks every incoming message read locally, then acknowledges it to
    /// the transport. An acknowledgement that fails is retried after the
    /// next successful sync pass.
    pub async fn mark_conversation_read(&self, id: &ConversationId) -> Result<usize, CoreError> {
        let Some(latest) = self.store.latest_incoming(id)? else {
            return Ok(0);
        };
        let changed = self.store.mark_read(id, &latest)?;
        if let Err(err) = self.transport.mark_read(id, &latest).await {
            warn!("read acknowledgement for {} deferred: {}", id, err);
            self.sync.note_pending_read(id, latest);
        }
        Ok(changed)
    }

    pub fn snapshot(&self, id: &ConversationId) -> Result<ConversationSnapshot, CoreError> {
        self.store.snapshot(id)
    }

    pub fn delivery_state(&self, client_id: &ClientId) -> Option<DeliveryState> {
        self.delivery.state(client_id)
    }

    pub fn shutdown(&self) {
        if let Some(listener) = self.listener_guard().take() {
            listener.abort();
        }
        self.sync.close_all();
        info!("core stopped");
    }
}

/// Handle on an open conversation. Each call to [`ConversationView::messages`]
/// walks a fresh snapshot.
#[derive(Clone)]
pub struct ConversationView {
    id: ConversationId,
    store: MessageStore,
    sync: SyncEngine,
    ticket: PassTicket,
}

impl ConversationView {
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Waits for the pass requested on open. False if the conversation was
    /// closed first.
    pub async fn synced(&self) -> bool {
        self.sync.wait_for(&self.id, self.ticket).await
    }

    pub fn snapshot(&self) -> Result<ConversationSnapshot, CoreError> {
        self.store.snapshot(&self.id)
    }

    pub fn messages(&self) -> MessageIter {
        match self.store.snapshot(&self.id) {
            Ok(snapshot) => snapshot.into_iter(),
            Err(_) => MessageIter::empty(),
        }
    }

    pub fn changes(&self) -> EventReceiver {
        self.store.subscribe()
    }
}

#[cfg(test)]
mod tests;
