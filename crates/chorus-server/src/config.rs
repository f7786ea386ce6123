use std::time::Duration;

/// Shared-store key and channel names. Every instance in a fleet must agree
/// on these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FleetKeys {
    pub chat_channel: String,
    pub presence_channel: String,
    pub anonymous_key: String,
    pub authorized_key: String,
}

impl Default for FleetKeys {
    fn default() -> Self {
        Self {
            chat_channel: "chat".into(),
            presence_channel: "user_count".into(),
            anonymous_key: "anonymous_users".into(),
            authorized_key: "authorized_users".into(),
        }
    }
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Outbound mailbox capacity per connection.
    pub max_send_queue: usize,
    /// Upper bound on any single shared-store or history call.
    pub store_timeout: Duration,
    /// Upper bound on the whole shutdown sequence.
    pub shutdown_grace: Duration,
    pub keys: FleetKeys,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_send_queue: 256,
            store_timeout: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(10),
            keys: FleetKeys::default(),
        }
    }
}
