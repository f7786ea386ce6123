use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::FleetError;

/// Payloads received on one pub/sub channel, in the transport's delivery
/// order. Dropping the stream releases the subscription.
pub type Subscription = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Operations the coordination layer needs from the shared store.
///
/// Every counter mutation is a single native atomic command on the backend.
/// Callers never read-modify-write, since other instances mutate the same
/// keys concurrently.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Backend name for logs ("redis", "memory").
    fn backend(&self) -> &'static str;

    async fn incr(&self, key: &str) -> Result<i64, FleetError>;
    async fn decr(&self, key: &str) -> Result<i64, FleetError>;
    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, FleetError>;

    /// Integer value at `key`, `None` when the key does not exist.
    async fn get_int(&self, key: &str) -> Result<Option<i64>, FleetError>;

    /// Add `delta` to a hash field and return the new value.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, FleetError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), FleetError>;
    /// Number of fields in the hash at `key`.
    async fn hlen(&self, key: &str) -> Result<i64, FleetError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), FleetError>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription, FleetError>;
}

/// Bound a store call. An elapsed deadline is a failure, never retried here.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, FleetError>
where
    F: Future<Output = Result<T, FleetError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| FleetError::Timeout(limit))?
}
