use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::FleetError;
use crate::store::{FleetStore, Subscription};

const CHANNEL_CAPACITY: usize = 1024;

/// In-process fleet store.
///
/// Backs single-instance deployments and lets tests run several complete
/// server stacks against one shared "fleet". Each key is updated under its
/// own DashMap entry lock, which gives the same per-command atomicity the
/// Redis backend has.
#[derive(Default)]
pub struct MemoryStore {
    counters: DashMap<String, i64>,
    hashes: DashMap<String, HashMap<String, i64>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every command fails until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// End every live subscription on `channel`, as if the connection to
    /// the store dropped. Later subscribes get a fresh channel.
    pub fn close_subscribers(&self, channel: &str) {
        self.channels.remove(channel);
    }

    /// Current value of a hash field, without going through the async API.
    pub fn hget(&self, key: &str, field: &str) -> Option<i64> {
        self.hashes.get(key).and_then(|h| h.get(field).copied())
    }

    fn check_online(&self) -> Result<(), FleetError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(FleetError::Unavailable("memory store offline".into()))
        } else {
            Ok(())
        }
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, FleetError> {
        self.check_online()?;
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn incr(&self, key: &str) -> Result<i64, FleetError> {
        self.add(key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64, FleetError> {
        self.add(key, -1)
    }

    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, FleetError> {
        self.add(key, -amount)
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>, FleetError> {
        self.check_online()?;
        Ok(self.counters.get(key).map(|v| *v))
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, FleetError> {
        self.check_online()?;
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let value = hash.entry(field.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), FleetError> {
        self.check_online()?;
        // Like Redis, an emptied hash stops existing.
        self.hashes.remove_if_mut(key, |_, hash| {
            hash.remove(field);
            hash.is_empty()
        });
        Ok(())
    }

    async fn hlen(&self, key: &str) -> Result<i64, FleetError> {
        self.check_online()?;
        Ok(self.hashes.get(key).map(|h| h.len() as i64).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), FleetError> {
        self.check_online()?;
        // No subscribers is not an error, same as PUBLISH returning 0.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, FleetError> {
        self.check_online()?;
        let channel_name = channel.to_string();
        let stream = BroadcastStream::new(self.sender(channel).subscribe()).filter_map(move |item| {
            let channel_name = channel_name.clone();
            async move {
                match item {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel_name, skipped, "Subscriber lagged, dropped payloads");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
