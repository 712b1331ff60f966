//! Reconciliation of the message store against the transport.
//!
//! Each open conversation owns a pass slot. At most one pass runs per slot;
//! requests made while a pass is scheduled join it, and requests made while a
//! pass runs schedule exactly one follow-up. Every `open` starts a new
//! session, and results fetched under an older session are dropped.

use crate::config::CoreConfig;
use crate::error::{CoreError, TransportError};
use crate::messaging::Transport;
use crate::store::MessageStore;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use vendorchat_api::{
    ConversationId, MessageId, MessagePage, StatusReceipt, SyncCursor, SyncState, UpdateBatch,
};

/// Identifies the pass that will satisfy a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassTicket {
    pub session: u64,
    pub pass: u64,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncShared>,
}

struct SyncShared {
    store: MessageStore,
    transport: Arc<dyn Transport>,
    config: CoreConfig,
    table: Mutex<SyncTable>,
}

#[derive(Default)]
struct SyncTable {
    slots: HashMap<ConversationId, PassSlot>,
    cursors: HashMap<ConversationId, SyncCursor>,
    global_cursor: Option<SyncCursor>,
    pending_reads: HashMap<ConversationId, MessageId>,
    next_session: u64,
    push_active: bool,
}

struct PassSlot {
    session: u64,
    scheduled: bool,
    running: bool,
    started: u64,
    completed: watch::Sender<u64>,
    poller: Option<JoinHandle<()>>,
}

impl PassSlot {
    fn new(session: u64) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            session,
            scheduled: false,
            running: false,
            started: 0,
            completed,
            poller: None,
        }
    }
}

impl Drop for PassSlot {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

struct FetchedPass {
    page: MessagePage,
    receipts: Vec<StatusReceipt>,
}

impl SyncEngine {
    pub fn new(store: MessageStore, transport: Arc<dyn Transport>, config: CoreConfig) -> Self {
        Self {
            inner: Arc::new(SyncShared {
                store,
                transport,
                config,
                table: Mutex::new(SyncTable::default()),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, SyncTable> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the conversation active, starts its poller and requests a pass.
    ///
    /// Opening a conversation that is already open keeps its session and
    /// joins the pass in progress, or schedules one when the slot is idle.
    pub fn open(&self, id: &ConversationId) -> PassTicket {
        let (session, ticket) = {
            let mut table = self.table();
            let current = table
                .slots
                .get(id)
                .map(|s| (s.session, s.running, s.scheduled, s.started));
            if let Some((session, running, scheduled, started)) = current {
                let ticket = if running && !scheduled {
                    Some(PassTicket {
                        session,
                        pass: started,
                    })
                } else {
                    self.schedule(&mut table, id, session)
                };
                drop(table);
                debug!("conversation {} already open, session {}", id, session);
                return ticket.unwrap_or(PassTicket {
                    session,
                    pass: started + 1,
                });
            }
            table.next_session += 1;
            let session = table.next_session;
            let mut slot = PassSlot::new(session);
            let period = self.inner.config.conversation_poll_interval_ms;
            if period > 0 && !table.push_active {
                slot.poller = Some(self.spawn_poller(id.clone(), session, period));
            }
            table.slots.insert(id.clone(), slot);
            let ticket = self.schedule(&mut table, id, session);
            (session, ticket)
        };
        debug!("conversation {} opened, session {}", id, session);
        ticket.unwrap_or(PassTicket { session, pass: 1 })
    }

    /// Deactivates the conversation. In-flight results for it are discarded.
    pub fn close(&self, id: &ConversationId) -> bool {
        let removed = self.table().slots.remove(id);
        if removed.is_some() {
            debug!("conversation {} closed", id);
        }
        removed.is_some()
    }

    pub fn is_active(&self, id: &ConversationId) -> bool {
        self.table().slots.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.table().slots.len()
    }

    pub fn cursor(&self, id: &ConversationId) -> Option<SyncCursor> {
        self.table().cursors.get(id).cloned()
    }

    pub fn global_cursor(&self) -> Option<SyncCursor> {
        self.table().global_cursor.clone()
    }

    pub fn push_active(&self) -> bool {
        self.table().push_active
    }

    /// Requests a pass for an active conversation. Returns `None` when the
    /// conversation is not open.
    pub fn request_pass(&self, id: &ConversationId) -> Option<PassTicket> {
        let mut table = self.table();
        let session = table.slots.get(id)?.session;
        self.schedule(&mut table, id, session)
    }

    fn request_in_session(&self, id: &ConversationId, session: u64) -> Option<PassTicket> {
        let mut table = self.table();
        self.schedule(&mut table, id, session)
    }

    fn schedule(
        &self,
        table: &mut SyncTable,
        id: &ConversationId,
        session: u64,
    ) -> Option<PassTicket> {
        let slot = table.slots.get_mut(id).filter(|s| s.session == session)?;
        let ticket = PassTicket {
            session,
            pass: slot.started + 1,
        };
        if slot.scheduled {
            return Some(ticket);
        }
        slot.scheduled = true;
        if !slot.running {
            slot.running = true;
            let engine = self.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.drive(id, session).await });
        }
        Some(ticket)
    }

    async fn drive(&self, id: ConversationId, session: u64) {
        loop {
            let pass = {
                let mut table = self.table();
                let Some(slot) = table.slots.get_mut(&id).filter(|s| s.session == session) else {
                    return;
                };
                if !slot.scheduled {
                    slot.running = false;
                    return;
                }
                slot.scheduled = false;
                slot.started += 1;
                slot.started
            };
            self.run_pass(&id, session).await;
            let table = self.table();
            match table.slots.get(&id).filter(|s| s.session == session) {
                Some(slot) => {
                    slot.completed.send_replace(pass);
                }
                None => return,
            }
        }
    }

    /// Resolves once the ticket's pass has finished. Returns false if the
    /// conversation was closed or reopened first.
    pub async fn wait_for(&self, id: &ConversationId, ticket: PassTicket) -> bool {
        let mut completed = {
            let table = self.table();
            match table.slots.get(id).filter(|s| s.session == ticket.session) {
                Some(slot) => slot.completed.subscribe(),
                None => return false,
            }
        };
        let ok = completed.wait_for(|done| *done >= ticket.pass).await.is_ok();
        ok
    }

    /// Requests a pass and waits for it.
    pub async fn sync_now(&self, id: &ConversationId) -> bool {
        match self.request_pass(id) {
            Some(ticket) => self.wait_for(id, ticket).await,
            None => false,
        }
    }

    fn is_current(&self, id: &ConversationId, session: u64) -> bool {
        self.table()
            .slots
            .get(id)
            .map(|s| s.session == session)
            .unwrap_or(false)
    }

    fn spawn_poller(&self, id: ConversationId, session: u64, period_ms: u64) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_millis(period_ms);
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if engine.request_in_session(&id, session).is_none() {
                    return;
                }
            }
        })
    }

    async fn fetch(
        &self,
        id: &ConversationId,
        since: Option<SyncCursor>,
    ) -> Result<FetchedPass, TransportError> {
        let transport = &self.inner.transport;
        let page = transport.fetch_messages(id, since.clone()).await?;
        let receipts = transport.fetch_receipts(id, since).await?;
        Ok(FetchedPass { page, receipts })
    }

    async fn run_pass(&self, id: &ConversationId, session: u64) {
        let since = self.cursor(id);
        let fetched = match self.fetch(id, since.clone()).await {
            Ok(fetched) => Ok(fetched),
            Err(err) if since.is_some() => {
                warn!("incremental sync of {} failed: {}, refetching", id, err);
                self.fetch(id, None).await
            }
            Err(err) => Err(err),
        };
        if !self.is_current(id, session) {
            debug!("discarding stale pass for {}", id);
            return;
        }
        match fetched {
            Ok(fetched) => {
                if let Err(err) = self.apply_pass(id, since, fetched) {
                    warn!("applying sync pass for {} failed: {}", id, err);
                    return;
                }
                self.flush_pending_read(id).await;
            }
            Err(err) => {
                warn!("sync of {} failed: {}", id, err);
                if self.inner.store.contains(id) {
                    let _ = self.inner.store.set_sync_state(id, SyncState::Degraded);
                }
            }
        }
    }

    fn apply_pass(
        &self,
        id: &ConversationId,
        previous: Option<SyncCursor>,
        fetched: FetchedPass,
    ) -> Result<(), CoreError> {
        let store = &self.inner.store;
        let FetchedPass { page, receipts } = fetched;
        let newest = page.messages.iter().map(|m| m.created_at_ms).max();
        if !page.messages.is_empty() {
            store.ensure_conversation(id, &id.value);
        }
        if !store.contains(id) {
            return Ok(());
        }
        let outcome = store.upsert_messages(id, page.messages)?;
        let receipts_applied = store.apply_receipts(id, &receipts)?;
        let cursor = page
            .next_cursor
            .or_else(|| newest.map(SyncCursor::from_timestamp))
            .or(previous);
        if let Some(cursor) = cursor {
            self.table().cursors.insert(id.clone(), cursor);
        }
        store.set_sync_state(id, SyncState::Fresh)?;
        debug!(
            "pass for {}: {} inserted, {} updated, {} receipts",
            id, outcome.inserted, outcome.updated, receipts_applied
        );
        Ok(())
    }

    /// Remembers a read acknowledgement the transport did not take.
    pub fn note_pending_read(&self, id: &ConversationId, up_to: MessageId) {
        self.table().pending_reads.insert(id.clone(), up_to);
    }

    pub fn pending_read(&self, id: &ConversationId) -> Option<MessageId> {
        self.table().pending_reads.get(id).cloned()
    }

    async fn flush_pending_read(&self, id: &ConversationId) {
        let Some(up_to) = self.table().pending_reads.remove(id) else {
            return;
        };
        match self.inner.transport.mark_read(id, &up_to).await {
            Ok(()) => info!("flushed read acknowledgement for {}", id),
            Err(err) => {
                warn!("read acknowledgement for {} still pending: {}", id, err);
                self.table()
                    .pending_reads
                    .entry(id.clone())
                    .or_insert(up_to);
            }
        }
    }

    /// Pages through the server's conversation list.
    pub async fn refresh_conversations(&self) -> Result<usize, CoreError> {
        let mut cursor = None;
        let mut applied = 0;
        for _ in 0..self.inner.config.conversation_page_limit.max(1) {
            let page = self.inner.transport.fetch_conversations(cursor).await?;
            for meta in &page.conversations {
                self.inner.store.apply_conversation_meta(meta);
            }
            applied += page.conversations.len();
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(applied)
    }

    /// Applies an update batch to every conversation it touches, open or not.
    pub fn apply_batch(&self, batch: UpdateBatch) -> usize {
        let store = &self.inner.store;
        let mut applied = 0;
        for meta in &batch.conversations {
            store.apply_conversation_meta(meta);
            applied += 1;
        }
        let mut messages: HashMap<ConversationId, Vec<_>> = HashMap::new();
        for message in batch.messages {
            messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
        for (id, batch_messages) in messages {
            store.ensure_conversation(&id, &id.value);
            match store.upsert_messages(&id, batch_messages) {
                Ok(outcome) => applied += outcome.inserted + outcome.updated,
                Err(err) => warn!("update for {} dropped: {}", id, err),
            }
        }
        let mut receipts: HashMap<ConversationId, Vec<StatusReceipt>> = HashMap::new();
        for receipt in batch.receipts {
            receipts
                .entry(receipt.conversation_id.clone())
                .or_default()
                .push(receipt);
        }
        for (id, batch_receipts) in receipts {
            if let Ok(changed) = store.apply_receipts(&id, &batch_receipts) {
                applied += changed;
            }
        }
        if let Some(cursor) = batch.next_cursor {
            self.table().global_cursor = Some(cursor);
        }
        applied
    }

    /// One poll of the global update feed.
    pub async fn poll_updates(&self) -> Result<usize, CoreError> {
        let since = self.global_cursor();
        let batch = match self.inner.transport.fetch_updates_since(since.clone()).await {
            Err(TransportError::CursorRejected) if since.is_some() => {
                warn!("update cursor rejected, refetching from start");
                self.inner.transport.fetch_updates_since(None).await?
            }
            other => other?,
        };
        Ok(self.apply_batch(batch))
    }

    /// Starts the global update listener: push when the transport offers it
    /// and the config prefers it, otherwise a poll loop. Returns `None` when
    /// neither is enabled.
    pub fn start_update_listener(&self) -> Option<JoinHandle<()>> {
        if self.inner.config.prefer_push {
            if let Some(mut updates) = self.inner.transport.subscribe_updates() {
                self.table().push_active = true;
                info!("listening to pushed updates");
                let engine = self.clone();
                return Some(tokio::spawn(async move {
                    loop {
                        match updates.recv().await {
                            Ok(batch) => {
                                engine.apply_batch(batch);
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!("update feed lagged by {}, polling", skipped);
                                if let Err(err) = engine.poll_updates().await {
                                    warn!("catch-up poll failed: {}", err);
                                }
                            }
                            Err(RecvError::Closed) => {
                                info!("update feed closed");
                                return;
                            }
                        }
                    }
                }));
            }
        }
        let interval_ms = self.inner.config.polling_interval_ms;
        if interval_ms == 0 {
            return None;
        }
        info!("polling updates every {}ms", interval_ms);
        let engine = self.clone();
        Some(tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms);
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(err) = engine.poll_updates().await {
                    debug!("update poll failed: {}", err);
                }
            }
        }))
    }

    pub fn close_all(&self) {
        self.table().slots.clear();
    }
}
