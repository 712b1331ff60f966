use crate::error::CoreError;
use crate::messaging::Transport;
use crate::policy::Policy;
use crate::store::MessageStore;
use crate::sync::SyncEngine;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use vendorchat_api::{ClientId, ConversationId, Message, MessageDraft, MessageStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    Queued,
    Sending { attempt: u32 },
    Backoff { attempt: u32, retry_in_ms: u64 },
    /// Attempt budget exhausted; waits for an explicit retry.
    Failed { attempts: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub queued: usize,
    pub in_flight: usize,
    pub backing_off: usize,
    pub failed: usize,
}

/// Outbound queue with one lane per conversation.
///
/// A lane sends its messages strictly in enqueue order and only moves on once
/// the head is confirmed or has exhausted its attempts. Lanes of different
/// conversations run concurrently.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<DeliveryShared>,
}

struct DeliveryShared {
    store: MessageStore,
    transport: Arc<dyn Transport>,
    policy: Policy,
    sync: Option<SyncEngine>,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<ClientId, Entry>,
    lanes: HashMap<ConversationId, Lane>,
}

struct Entry {
    conversation_id: ConversationId,
    state: DeliveryState,
    cancel: Arc<Notify>,
}

#[derive(Default)]
struct Lane {
    queue: VecDeque<ClientId>,
    running: bool,
}

enum Attempt {
    Confirmed,
    Retry,
    Exhausted,
    Abandoned,
}

impl DeliveryQueue {
    pub fn new(
        store: MessageStore,
        transport: Arc<dyn Transport>,
        policy: Policy,
        sync: Option<SyncEngine>,
    ) -> Self {
        Self {
            inner: Arc::new(DeliveryShared {
                store,
                transport,
                policy,
                sync,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends the draft to the store as `Pending` and queues it. Returns
    /// without waiting for the network.
    pub fn enqueue(&self, draft: &MessageDraft) -> Result<Message, CoreError> {
        let message = self.inner.store.append_outgoing(draft)?;
        let client_id = message
            .client_id
            .ok_or_else(|| CoreError::NotFound("client id".to_string()))?;
        self.schedule(&draft.conversation_id, client_id);
        debug!("queued {} for {}", client_id, draft.conversation_id);
        Ok(message)
    }

    fn schedule(&self, conversation_id: &ConversationId, client_id: ClientId) {
        let mut state = self.state_guard();
        state.entries.insert(
            client_id,
            Entry {
                conversation_id: conversation_id.clone(),
                state: DeliveryState::Queued,
                cancel: Arc::new(Notify::new()),
            },
        );
        let lane = state.lanes.entry(conversation_id.clone()).or_default();
        lane.queue.push_back(client_id);
        if !lane.running {
            lane.running = true;
            let queue = self.clone();
            let conversation_id = conversation_id.clone();
            tokio::spawn(async move { queue.run_lane(conversation_id).await });
        }
    }

    async fn run_lane(&self, conversation_id: ConversationId) {
        loop {
            let next = {
                let mut state = self.state_guard();
                let Some(lane) = state.lanes.get_mut(&conversation_id) else {
                    return;
                };
                match lane.queue.pop_front() {
                    Some(client_id) => client_id,
                    None => {
                        state.lanes.remove(&conversation_id);
                        return;
                    }
                }
            };
            self.deliver(&conversation_id, next).await;
        }
    }

    async fn deliver(&self, conversation_id: &ConversationId, client_id: ClientId) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(conversation_id, client_id, attempt).await {
                Attempt::Confirmed | Attempt::Abandoned | Attempt::Exhausted => return,
                Attempt::Retry => {}
            }
            let delay_ms = self.backoff_ms(attempt);
            let Some(cancel) = self.transition(&client_id, DeliveryState::Backoff {
                attempt,
                retry_in_ms: delay_ms,
            }) else {
                return;
            };
            debug!("{} retrying in {}ms", client_id, delay_ms);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = cancel.notified() => {
                    debug!("backoff of {} cancelled", client_id);
                    return;
                }
            }
        }
    }

    async fn attempt(
        &self,
        conversation_id: &ConversationId,
        client_id: ClientId,
        attempt: u32,
    ) -> Attempt {
        let store = &self.inner.store;
        if self
            .transition(&client_id, DeliveryState::Sending { attempt })
            .is_none()
        {
            return Attempt::Abandoned;
        }
        let Some(message) = store.find_by_client(&client_id) else {
            self.forget(&client_id);
            return Attempt::Abandoned;
        };
        if message.status.is_confirmed() {
            self.forget(&client_id);
            return Attempt::Confirmed;
        }
        if store
            .set_local_status(&client_id, MessageStatus::Sending)
            .is_err()
        {
            self.forget(&client_id);
            return Attempt::Abandoned;
        }
        let result = self
            .inner
            .transport
            .send_message(
                conversation_id,
                client_id,
                &message.body,
                message.attachment_ref.as_ref(),
            )
            .await;
        match result {
            Ok(confirmed) => {
                if let Err(err) = store.upsert_messages(conversation_id, vec![confirmed]) {
                    warn!("confirmation of {} not stored: {}", client_id, err);
                }
                self.forget(&client_id);
                info!("{} sent on attempt {}", client_id, attempt);
                if let Some(sync) = self.inner.sync.as_ref() {
                    sync.request_pass(conversation_id);
                }
                Attempt::Confirmed
            }
            Err(err) => {
                warn!("send of {} failed on attempt {}: {}", client_id, attempt, err);
                if store
                    .set_local_status(&client_id, MessageStatus::Failed)
                    .is_err()
                {
                    debug!("{} discarded while sending", client_id);
                    self.forget(&client_id);
                    return Attempt::Abandoned;
                }
                if attempt >= self.inner.policy.max_send_attempts.max(1) {
                    self.transition(&client_id, DeliveryState::Failed { attempts: attempt });
                    warn!("{} failed after {} attempts", client_id, attempt);
                    Attempt::Exhausted
                } else {
                    Attempt::Retry
                }
            }
        }
    }

    fn backoff_ms(&self, failed_attempts: u32) -> u64 {
        let policy = &self.inner.policy;
        let base = policy.backoff_delay_ms(failed_attempts);
        let jitter = if policy.backoff_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=policy.backoff_jitter_ms)
        } else {
            0
        };
        base.saturating_add(jitter)
    }

    /// Updates a live entry. Returns its cancel handle, or `None` once the
    /// entry has been cancelled.
    fn transition(&self, client_id: &ClientId, next: DeliveryState) -> Option<Arc<Notify>> {
        let mut state = self.state_guard();
        let entry = state.entries.get_mut(client_id)?;
        entry.state = next;
        Some(entry.cancel.clone())
    }

    fn forget(&self, client_id: &ClientId) {
        self.state_guard().entries.remove(client_id);
    }

    /// Re-queues a message that exhausted its attempts, with the same client
    /// id and a fresh attempt budget. Returns false when the message is
    /// already confirmed or still being worked on.
    pub fn retry(&self, client_id: &ClientId) -> Result<bool, CoreError> {
        let message = self
            .inner
            .store
            .find_by_client(client_id)
            .ok_or_else(|| CoreError::NotFound(format!("message {}", client_id)))?;
        if message.status.is_confirmed() {
            return Ok(false);
        }
        let busy = matches!(
            self.state(client_id),
            Some(DeliveryState::Queued | DeliveryState::Sending { .. } | DeliveryState::Backoff { .. })
        );
        if busy {
            return Ok(false);
        }
        self.inner
            .store
            .set_local_status(client_id, MessageStatus::Pending)?;
        self.schedule(&message.conversation_id, *client_id);
        info!("{} re-queued", client_id);
        Ok(true)
    }

    /// Drops a queued, backing-off or failed entry and cancels its timer.
    /// An attempt already on the wire is not interrupted.
    pub fn cancel(&self, client_id: &ClientId) -> bool {
        let mut state = self.state_guard();
        match state.entries.get(client_id).map(|e| e.state) {
            None | Some(DeliveryState::Sending { .. }) => return false,
            Some(_) => {}
        }
        let Some(entry) = state.entries.remove(client_id) else {
            return false;
        };
        entry.cancel.notify_one();
        if let Some(lane) = state.lanes.get_mut(&entry.conversation_id) {
            lane.queue.retain(|queued| queued != client_id);
        }
        debug!("{} cancelled", client_id);
        true
    }

    pub fn state(&self, client_id: &ClientId) -> Option<DeliveryState> {
        self.state_guard().entries.get(client_id).map(|e| e.state)
    }

    pub fn stats(&self) -> DeliveryStats {
        let state = self.state_guard();
        let mut stats = DeliveryStats::default();
        for entry in state.entries.values() {
            match entry.state {
                DeliveryState::Queued => stats.queued += 1,
                DeliveryState::Sending { .. } => stats.in_flight += 1,
                DeliveryState::Backoff { .. } => stats.backing_off += 1,
                DeliveryState::Failed { .. } => stats.failed += 1,
            }
        }
        stats
    }
}
