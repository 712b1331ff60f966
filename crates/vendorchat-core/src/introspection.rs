#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreStats {
    pub conversations: usize,
    pub active_conversations: usize,
    pub degraded_conversations: usize,
    pub total_unread: u32,
    pub queued_deliveries: usize,
    pub in_flight_deliveries: usize,
    pub backing_off_deliveries: usize,
    pub failed_deliveries: usize,
}

impl crate::Core {
    pub fn stats(&self) -> CoreStats {
        let delivery = self.delivery.stats();
        CoreStats {
            conversations: self.store.conversations().len(),
            active_conversations: self.sync.active_count(),
            degraded_conversations: self.store.degraded_count(),
            total_unread: self.store.unread_total(),
            queued_deliveries: delivery.queued,
            in_flight_deliveries: delivery.in_flight,
            backing_off_deliveries: delivery.backing_off,
            failed_deliveries: delivery.failed,
        }
    }
}
