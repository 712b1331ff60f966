use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Interval of the global update poll. Zero disables polling.
    pub polling_interval_ms: u64,
    /// Interval of reconciliation passes for an open conversation. Zero
    /// disables periodic passes; explicit and post-send passes still run.
    pub conversation_poll_interval_ms: u64,
    /// Listen to the transport's push channel when it offers one.
    pub prefer_push: bool,
    pub event_capacity: usize,
    pub preview_max_chars: usize,
    /// Upper bound of pages fetched by one conversation list refresh.
    pub conversation_page_limit: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 2000,
            conversation_poll_interval_ms: 5000,
            prefer_push: true,
            event_capacity: 256,
            preview_max_chars: 80,
            conversation_page_limit: 20,
        }
    }
}
