//! Fleet-wide fan-out over the shared pub/sub store.
//!
//! Publishing never delivers locally. Every instance, the publisher included,
//! receives its own publishes back through the subscription and hands them to
//! the registry, so there is exactly one local delivery path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chorus_core::{ChatEvent, OutboundFrame, PresenceEvent};
use chorus_fleet::{with_timeout, FleetError, FleetStore, Subscription};

use crate::registry::Registry;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

/// An event that travels over a fan-out channel.
trait BusEvent: DeserializeOwned + Send + 'static {
    const KIND: &'static str;
    fn into_frame(self) -> OutboundFrame;
}

impl BusEvent for ChatEvent {
    const KIND: &'static str = "chat";
    fn into_frame(self) -> OutboundFrame {
        OutboundFrame::Message(self)
    }
}

impl BusEvent for PresenceEvent {
    const KIND: &'static str = "presence";
    fn into_frame(self) -> OutboundFrame {
        OutboundFrame::UserCount(self)
    }
}

pub struct FanoutBus {
    store: Arc<dyn FleetStore>,
    registry: Arc<Registry>,
    chat_channel: String,
    presence_channel: String,
    op_timeout: Duration,
    started: AtomicBool,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl FanoutBus {
    pub fn new(
        store: Arc<dyn FleetStore>,
        registry: Arc<Registry>,
        chat_channel: impl Into<String>,
        presence_channel: impl Into<String>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            chat_channel: chat_channel.into(),
            presence_channel: presence_channel.into(),
            op_timeout,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to both channels and spawn one receive loop per channel.
    ///
    /// Calls after the first success are no-ops. A failed subscribe leaves
    /// the bus unstarted so a later call can retry.
    pub async fn start(&self) -> Result<(), FanoutError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let subscriptions = async {
            let chat = with_timeout(self.op_timeout, self.store.subscribe(&self.chat_channel)).await?;
            let presence =
                with_timeout(self.op_timeout, self.store.subscribe(&self.presence_channel)).await?;
            Ok::<_, FleetError>((chat, presence))
        }
        .await;

        let (chat, presence) = match subscriptions {
            Ok(pair) => pair,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                tracing::error!(error = %e, kind = e.error_kind(), "Fan-out subscribe failed");
                return Err(e.into());
            }
        };

        let mut loops = self.loops.lock();
        loops.push(tokio::spawn(receive_loop::<ChatEvent>(
            self.chat_channel.clone(),
            chat,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.cancel.clone(),
        )));
        loops.push(tokio::spawn(receive_loop::<PresenceEvent>(
            self.presence_channel.clone(),
            presence,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.cancel.clone(),
        )));

        tracing::info!(
            chat = %self.chat_channel,
            presence = %self.presence_channel,
            backend = self.store.backend(),
            "Fan-out bus started"
        );
        Ok(())
    }

    /// Publish a persisted chat to every instance.
    pub async fn publish_chat(&self, event: &ChatEvent) -> Result<(), FanoutError> {
        let payload = OutboundFrame::Message(event.clone()).to_json()?;
        self.publish(&self.chat_channel, &payload).await
    }

    /// Publish a presence snapshot to every instance.
    pub async fn publish_presence(&self, event: PresenceEvent) -> Result<(), FanoutError> {
        let payload = OutboundFrame::UserCount(event).to_json()?;
        self.publish(&self.presence_channel, &payload).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), FanoutError> {
        with_timeout(self.op_timeout, self.store.publish(channel, payload)).await?;
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Cancel both receive loops and wait for them to release their
    /// subscriptions.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }
    }
}

async fn receive_loop<E: BusEvent>(
    channel: String,
    mut subscription: Subscription,
    store: Arc<dyn FleetStore>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            next = subscription.next() => next,
        };

        let Some(payload) = payload else {
            let e = FleetError::Closed(channel.clone());
            tracing::warn!(error = %e, kind = e.error_kind(), "Subscription ended, resubscribing");
            match resubscribe(&channel, store.as_ref(), &cancel).await {
                Some(fresh) => {
                    subscription = fresh;
                    continue;
                }
                None => break,
            }
        };

        let event: E = match serde_json::from_str(&payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(channel = %channel, kind = E::KIND, error = %e, "Skipping malformed payload");
                continue;
            }
        };

        match event.into_frame().to_json() {
            Ok(json) => {
                let delivered = registry.broadcast(&json);
                tracing::trace!(channel = %channel, delivered, "Fanned out");
            }
            Err(e) => tracing::warn!(channel = %channel, error = %e, "Failed to encode frame"),
        }
    }

    drop(subscription);
    tracing::info!(channel = %channel, "Receive loop stopped");
}

/// Retry the subscription until it succeeds or the bus is stopped.
async fn resubscribe(
    channel: &str,
    store: &dyn FleetStore,
    cancel: &CancellationToken,
) -> Option<Subscription> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
        }
        match store.subscribe(channel).await {
            Ok(subscription) => {
                tracing::info!(channel, "Resubscribed");
                return Some(subscription);
            }
            Err(e) => tracing::warn!(channel, error = %e, "Resubscribe failed"),
        }
    }
}
