//! Runtime settings shared by the server and the console client.

/// Address used when `CHAT_RELAY_ADDR` is not set.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8000";

/// Environment variable overriding the relay address.
pub const ADDR_ENV: &str = "CHAT_RELAY_ADDR";

/// Capacity of each client's outbound queue. A full queue blocks the coordinator.
pub const CLIENT_QUEUE_CAPACITY: usize = 10;

/// Capacity of each coordinator event channel (join, leave, chat).
pub const EVENT_QUEUE_CAPACITY: usize = 10;

/// Non-EOF read errors in a row that a reader tolerates before it gives up.
///
/// Any successful read resets the count. On reaching it the server handles the
/// peer as a disconnect (a LeaveRequest if logged in) and the console client
/// reports the server as gone.
pub const MAX_CONSECUTIVE_READ_ERRORS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// `host:port` the server listens on and the client connects to.
    pub addr: String,
    pub client_queue_capacity: usize,
    pub event_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            client_queue_capacity: CLIENT_QUEUE_CAPACITY,
            event_queue_capacity: EVENT_QUEUE_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::with_addr(std::env::var(ADDR_ENV).ok())
    }

    fn with_addr(addr: Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = addr.map(|addr| addr.trim().to_string()) {
            if !addr.is_empty() {
                config.addr = addr;
            }
        }
        config
    }
}
