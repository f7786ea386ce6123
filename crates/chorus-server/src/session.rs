//! Per-connection protocol handling.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use chorus_core::{
    AuthOutcome, Authenticator, ChatEvent, ChatHistory, ConnectionId, HistoryError, Identity,
    InboundFrame, NewChat, OutboundFrame,
};

use crate::fanout::{FanoutBus, FanoutError};
use crate::presence::PresenceCounter;
use crate::registry::{Registry, Transport};
use crate::shutdown::ExitFlag;

/// Authentication state of one connection. Once authenticated it stays
/// authenticated for the life of the connection.
#[derive(Clone, Debug)]
pub struct SessionContext {
    connection_id: ConnectionId,
    identity: Option<Identity>,
}

impl SessionContext {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            identity: None,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Signed in with a usable name and email.
    pub fn is_authenticated(&self) -> bool {
        self.identity
            .as_ref()
            .is_some_and(|i| !i.name.is_empty() && !i.email.is_empty())
    }

    /// Returns false, leaving the existing identity alone, if already set.
    fn authenticate(&mut self, identity: Identity) -> bool {
        if self.identity.is_some() {
            return false;
        }
        self.identity = Some(identity);
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatSendError {
    #[error("sender is not signed in")]
    Unauthenticated,

    #[error("history store timed out after {0:?}")]
    PersistTimeout(Duration),

    #[error("failed to persist chat: {0}")]
    Persist(#[from] HistoryError),

    #[error("failed to publish chat: {0}")]
    Publish(#[from] FanoutError),
}

pub struct SessionCoordinator {
    registry: Arc<Registry>,
    presence: Arc<PresenceCounter>,
    bus: Arc<FanoutBus>,
    auth: Arc<dyn Authenticator>,
    history: Arc<dyn ChatHistory>,
    exit: ExitFlag,
    op_timeout: Duration,
}

impl SessionCoordinator {
    pub fn new(
        registry: Arc<Registry>,
        presence: Arc<PresenceCounter>,
        bus: Arc<FanoutBus>,
        auth: Arc<dyn Authenticator>,
        history: Arc<dyn ChatHistory>,
        exit: ExitFlag,
        op_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            presence,
            bus,
            auth,
            history,
            exit,
            op_timeout,
        }
    }

    /// Drive one connection from upgrade to close.
    ///
    /// Reads until `inbound` ends or the registry closes the connection,
    /// then runs disconnect bookkeeping.
    pub async fn run_connection<T, S>(self: &Arc<Self>, transport: T, mut inbound: S)
    where
        T: Transport,
        S: Stream<Item = String> + Unpin + Send,
    {
        let Some((mut ctx, closed)) = self.on_connect(transport).await else {
            return;
        };
        let span = tracing::info_span!("connection", connection_id = %ctx.connection_id());

        async {
            tracing::info!("Client connected");
            loop {
                let raw = tokio::select! {
                    _ = closed.cancelled() => break,
                    raw = inbound.next() => raw,
                };
                match raw {
                    Some(raw) => self.on_frame(&mut ctx, &raw).await,
                    None => break,
                }
            }
            self.on_disconnect(&ctx).await;
            tracing::info!("Client disconnected");
        }
        .instrument(span)
        .await
    }

    /// Register a fresh connection and count it as anonymous. Refused once
    /// the process is exiting.
    pub async fn on_connect<T: Transport>(
        &self,
        transport: T,
    ) -> Option<(SessionContext, CancellationToken)> {
        if self.exit.is_exiting() {
            tracing::debug!("Exiting, refusing connection");
            return None;
        }
        let connection_id = ConnectionId::new();
        let closed = self.registry.register(connection_id.clone(), transport)?;

        self.presence.increment_anonymous().await;
        self.publish_presence().await;
        Some((SessionContext::new(connection_id), closed))
    }

    /// Tear down bookkeeping for a closed connection. Skipped while the
    /// process is exiting, since shutdown reconciles presence in bulk.
    pub async fn on_disconnect(&self, ctx: &SessionContext) {
        if self.exit.is_exiting() {
            tracing::debug!(connection_id = %ctx.connection_id(), "Exiting, skipping disconnect bookkeeping");
            return;
        }

        self.registry.unregister(ctx.connection_id());
        match ctx.identity() {
            Some(identity) => self.presence.decrement_authorized(&identity.user_id).await,
            None => self.presence.decrement_anonymous().await,
        }
        self.publish_presence().await;
    }

    /// Dispatch one raw inbound text frame.
    pub async fn on_frame(self: &Arc<Self>, ctx: &mut SessionContext, raw: &str) {
        let frame = match InboundFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(connection_id = %ctx.connection_id(), error = %e, "Skipping undecodable frame");
                return;
            }
        };

        match frame {
            InboundFrame::Ping => self.on_ping(ctx),
            InboundFrame::Auth { content } => self.on_auth(ctx, &content).await,
            InboundFrame::Message { subject, content } => self.on_chat(ctx, subject, content),
            InboundFrame::Unknown => {
                tracing::trace!(connection_id = %ctx.connection_id(), "Ignoring unknown frame type");
            }
        }
    }

    pub fn on_ping(&self, ctx: &SessionContext) {
        self.registry.send_frame(ctx.connection_id(), &OutboundFrame::Pong);
    }

    pub async fn on_auth(&self, ctx: &mut SessionContext, token: &str) {
        match self.auth.verify(token).await {
            AuthOutcome::Verified(identity) => {
                let user_id = identity.user_id.clone();
                let first = ctx.authenticate(identity);
                self.registry.send_frame(ctx.connection_id(), &OutboundFrame::SignedIn);
                if !first {
                    tracing::debug!(connection_id = %ctx.connection_id(), "Already signed in, presence unchanged");
                    return;
                }
                tracing::info!(connection_id = %ctx.connection_id(), user_id = %user_id, "Signed in");
                self.presence.decrement_anonymous().await;
                self.presence.increment_authorized(&user_id).await;
                self.publish_presence().await;
            }
            AuthOutcome::Expired => {
                self.registry.send_frame(ctx.connection_id(), &OutboundFrame::Refresh);
            }
            AuthOutcome::Absent => {
                tracing::debug!(connection_id = %ctx.connection_id(), "Auth frame without usable token");
            }
        }
    }

    /// Persist and publish a chat on its own task. Unauthenticated senders
    /// are refused immediately.
    pub fn on_chat(self: &Arc<Self>, ctx: &SessionContext, subject: String, body: String) {
        let connection_id = ctx.connection_id().clone();
        let identity = match ctx.identity() {
            Some(identity) if ctx.is_authenticated() => identity.clone(),
            _ => {
                tracing::debug!(connection_id = %connection_id, error = %ChatSendError::Unauthenticated, "Chat refused");
                self.registry.send_frame(&connection_id, &OutboundFrame::MessageFailed);
                return;
            }
        };

        let this = Arc::clone(self);
        tokio::spawn(
            async move {
                if let Err(e) = this.send_chat(&identity, subject, body).await {
                    tracing::warn!(user_id = %identity.user_id, error = %e, "Chat send failed");
                    this.registry.send_frame(&connection_id, &OutboundFrame::MessageFailed);
                }
            }
            .in_current_span(),
        );
    }

    /// Persist then publish. Never retried.
    pub async fn send_chat(
        &self,
        identity: &Identity,
        subject: String,
        body: String,
    ) -> Result<ChatEvent, ChatSendError> {
        let chat = NewChat::now(subject, body, &identity.name, &identity.email);
        let event = tokio::time::timeout(self.op_timeout, self.history.persist_chat(chat))
            .await
            .map_err(|_| ChatSendError::PersistTimeout(self.op_timeout))??;
        self.bus.publish_chat(&event).await?;
        Ok(event)
    }

    async fn publish_presence(&self) {
        if let Err(e) = self.presence.publish_snapshot().await {
            tracing::warn!(error = %e, "Failed to publish presence snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{recording_transport, test_node, test_node_with, FlakyHistory, StaticAuth};
    use chorus_fleet::{FleetStore, MemoryStore};

    fn bob() -> Identity {
        Identity {
            user_id: "u2".into(),
            name: "Bob".into(),
            email: "bob@example.com".into(),
        }
    }

    #[test]
    fn context_starts_unauthenticated_and_never_reverts() {
        let mut ctx = SessionContext::new(ConnectionId::new());
        assert!(!ctx.is_authenticated());

        assert!(ctx.authenticate(bob()));
        assert!(ctx.is_authenticated());

        let other = Identity {
            user_id: "u9".into(),
            name: "Eve".into(),
            email: "eve@example.com".into(),
        };
        assert!(!ctx.authenticate(other));
        assert_eq!(ctx.identity().unwrap().user_id, "u2");
    }

    #[test]
    fn identity_without_email_is_not_authenticated() {
        let mut ctx = SessionContext::new(ConnectionId::new());
        ctx.authenticate(Identity {
            user_id: "u3".into(),
            name: "Nameless".into(),
            email: String::new(),
        });
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn ping_gets_one_pong_to_sender_only() {
        let node = test_node(Arc::new(MemoryStore::new())).await;
        let (t1, mut log1) = recording_transport();
        let (t2, mut log2) = recording_transport();
        let (mut ctx, _) = node.coordinator.on_connect(t1).await.unwrap();
        node.coordinator.on_connect(t2).await.unwrap();

        node.coordinator.on_frame(&mut ctx, r#"{"type":"ping"}"#).await;

        assert_eq!(log1.next_non_presence().await.unwrap()["type"], "pong");
        assert!(log1.next_non_presence().await.is_none());
        assert!(log2.next_non_presence().await.is_none());
    }

    #[tokio::test]
    async fn connect_and_disconnect_conserve_anonymous_count() {
        let node = test_node(Arc::new(MemoryStore::new())).await;
        let before = node.presence.anonymous_count().await.unwrap();

        let mut contexts = Vec::new();
        for _ in 0..5 {
            let (t, _log) = recording_transport();
            contexts.push(node.coordinator.on_connect(t).await.unwrap().0);
        }
        assert_eq!(node.presence.anonymous_count().await.unwrap(), before + 5);

        for ctx in &contexts {
            node.coordinator.on_disconnect(ctx).await;
        }
        assert_eq!(node.presence.anonymous_count().await.unwrap(), before);
        assert_eq!(node.registry.count(), 0);
    }

    #[tokio::test]
    async fn connect_broadcasts_user_count() {
        let node = test_node(Arc::new(MemoryStore::new())).await;
        let (t, mut log) = recording_transport();
        node.coordinator.on_connect(t).await.unwrap();

        let frame = log.next_frame().await;
        assert_eq!(frame["type"], "user_count");
        assert_eq!(frame["anonymousUsers"], 1);
        assert_eq!(frame["authorizedUsers"], 0);
    }

    #[tokio::test]
    async fn valid_token_signs_in_and_moves_presence() {
        let store = Arc::new(MemoryStore::new());
        let auth = StaticAuth::default().with("good", AuthOutcome::Verified(bob()));
        let node = test_node_with(Arc::clone(&store), auth, FlakyHistory::new()).await;
        let (t, mut log) = recording_transport();
        let (mut ctx, _) = node.coordinator.on_connect(t).await.unwrap();

        node.coordinator
            .on_frame(&mut ctx, r#"{"type":"auth","content":"good"}"#)
            .await;

        assert!(ctx.is_authenticated());
        assert_eq!(log.next_non_presence().await.unwrap()["type"], "signed_in");
        assert_eq!(node.presence.anonymous_count().await.unwrap(), 0);
        assert_eq!(store.hget("authorized_users", "u2"), Some(1));

        node.coordinator.on_disconnect(&ctx).await;
        assert_eq!(store.hget("authorized_users", "u2"), None);
        assert_eq!(node.presence.anonymous_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_auth_acks_without_double_counting() {
        let store = Arc::new(MemoryStore::new());
        let auth = StaticAuth::default().with("good", AuthOutcome::Verified(bob()));
        let node = test_node_with(Arc::clone(&store), auth, FlakyHistory::new()).await;
        let (t, mut log) = recording_transport();
        let (mut ctx, _) = node.coordinator.on_connect(t).await.unwrap();

        for _ in 0..2 {
            node.coordinator
                .on_frame(&mut ctx, r#"{"type":"auth","content":"good"}"#)
                .await;
        }

        assert_eq!(log.next_non_presence().await.unwrap()["type"], "signed_in");
        assert_eq!(log.next_non_presence().await.unwrap()["type"], "signed_in");
        assert_eq!(node.presence.anonymous_count().await.unwrap(), 0);
        assert_eq!(store.hget("authorized_users", "u2"), Some(1));
    }

    #[tokio::test]
    async fn expired_token_gets_refresh_only() {
        let auth = StaticAuth::default().with("stale", AuthOutcome::Expired);
        let node = test_node_with(Arc::new(MemoryStore::new()), auth, FlakyHistory::new()).await;
        let (t, mut log) = recording_transport();
        let (mut ctx, _) = node.coordinator.on_connect(t).await.unwrap();

        node.coordinator
            .on_frame(&mut ctx, r#"{"type":"auth","content":"stale"}"#)
            .await;

        assert_eq!(log.next_non_presence().await.unwrap()["type"], "refresh");
        assert!(log.next_non_presence().await.is_none());
        assert!(!ctx.is_authenticated());
        assert_eq!(node.presence.anonymous_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_token_is_silent() {
        let node = test_node(Arc::new(MemoryStore::new())).await;
        let (t, mut log) = recording_transport();
        let (mut ctx, _) = node.coordinator.on_connect(t).await.unwrap();

        node.coordinator
            .on_frame(&mut ctx, r#"{"type":"auth","content":"forged"}"#)
            .await;

        assert!(log.next_non_presence().await.is_none());
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn unauthenticated_chat_fails_without_publishing() {
        let store = Arc::new(MemoryStore::new());
        let node = test_node(Arc::clone(&store)).await;
        let mut chat_channel = store.subscribe("chat").await.unwrap();
        let (t, mut log) = recording_transport();
        let (mut ctx, _) = node.coordinator.on_connect(t).await.unwrap();

        node.coordinator
            .on_frame(&mut ctx, r#"{"type":"message","subject":"hi","content":"hello"}"#)
            .await;

        assert_eq!(log.next_non_presence().await.unwrap()["type"], "message_failed");
        assert!(log.next_non_presence().await.is_none());
        let published = tokio::time::timeout(Duration::from_millis(100), chat_channel.next()).await;
        assert!(published.is_err());
    }

    #[tokio::test]
    async fn chat_is_persisted_then_delivered_to_sender() {
        let auth = StaticAuth::default().with("good", AuthOutcome::Verified(bob()));
        let history = FlakyHistory::new();
        let node = test_node_with(Arc::new(MemoryStore::new()), auth, history.clone()).await;
        let (t, mut log) = recording_transport();
        let (mut ctx, _) = node.coordinator.on_connect(t).await.unwrap();
        node.coordinator
            .on_frame(&mut ctx, r#"{"type":"auth","content":"good"}"#)
            .await;
        log.next_non_presence().await;

        node.coordinator
            .on_frame(&mut ctx, r#"{"type":"message","subject":"hi","content":"hello"}"#)
            .await;

        let frame = log.next_non_presence().await.unwrap();
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["subject"], "hi");
        assert_eq!(frame["message"], "hello");
        assert_eq!(frame["name"], "Bob");
        let page = history.page_messages(i64::MAX).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(frame["id"], page[0].id.as_str());
    }

    #[tokio::test]
    async fn persistence_failure_reports_message_failed() {
        let auth = StaticAuth::default().with("good", AuthOutcome::Verified(bob()));
        let history = FlakyHistory::new();
        let node = test_node_with(Arc::new(MemoryStore::new()), auth, history.clone()).await;
        let (t, mut log) = recording_transport();
        let (mut ctx, _) = node.coordinator.on_connect(t).await.unwrap();
        node.coordinator
            .on_frame(&mut ctx, r#"{"type":"auth","content":"good"}"#)
            .await;
        log.next_non_presence().await;

        history.set_failing(true);
        node.coordinator
            .on_frame(&mut ctx, r#"{"type":"message","subject":"hi","content":"hello"}"#)
            .await;

        assert_eq!(log.next_non_presence().await.unwrap()["type"], "message_failed");
        assert!(log.next_non_presence().await.is_none());
    }

    #[tokio::test]
    async fn publish_failure_reports_message_failed() {
        let store = Arc::new(MemoryStore::new());
        let auth = StaticAuth::default().with("good", AuthOutcome::Verified(bob()));
        let node = test_node_with(Arc::clone(&store), auth, FlakyHistory::new()).await;

        store.set_offline(true);
        let err = node
            .coordinator
            .send_chat(&bob(), "hi".into(), "hello".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatSendError::Publish(_)));
    }

    #[tokio::test]
    async fn garbage_and_unknown_frames_are_ignored() {
        let node = test_node(Arc::new(MemoryStore::new())).await;
        let (t, mut log) = recording_transport();
        let (mut ctx, _) = node.coordinator.on_connect(t).await.unwrap();

        node.coordinator.on_frame(&mut ctx, "{{{").await;
        node.coordinator.on_frame(&mut ctx, r#"{"type":"typing"}"#).await;
        node.coordinator.on_frame(&mut ctx, r#"{"type":"ping"}"#).await;

        assert_eq!(log.next_non_presence().await.unwrap()["type"], "pong");
    }

    #[tokio::test]
    async fn disconnect_while_exiting_skips_presence() {
        let node = test_node(Arc::new(MemoryStore::new())).await;
        let (t, _log) = recording_transport();
        let (ctx, _) = node.coordinator.on_connect(t).await.unwrap();
        node.reconciler.shutdown().await.unwrap();
        let after_shutdown = node.presence.anonymous_count().await.unwrap();

        node.coordinator.on_disconnect(&ctx).await;
        assert_eq!(node.presence.anonymous_count().await.unwrap(), after_shutdown);
    }

    #[tokio::test]
    async fn chat_crosses_instances() {
        let store = Arc::new(MemoryStore::new());
        let alice = Identity {
            user_id: "u1".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
        };
        let auth = StaticAuth::default()
            .with("alice", AuthOutcome::Verified(alice))
            .with("bob", AuthOutcome::Verified(bob()));
        let history = FlakyHistory::new();
        let node_a = test_node_with(Arc::clone(&store), auth.clone(), history.clone()).await;
        let node_b = test_node_with(Arc::clone(&store), auth, history).await;

        let (ta, mut log_a) = recording_transport();
        let (mut ctx_a, _) = node_a.coordinator.on_connect(ta).await.unwrap();
        node_a
            .coordinator
            .on_frame(&mut ctx_a, r#"{"type":"auth","content":"alice"}"#)
            .await;
        assert_eq!(log_a.next_non_presence().await.unwrap()["type"], "signed_in");

        let (tb, mut log_b) = recording_transport();
        let (mut ctx_b, _) = node_b.coordinator.on_connect(tb).await.unwrap();
        node_b
            .coordinator
            .on_frame(&mut ctx_b, r#"{"type":"auth","content":"bob"}"#)
            .await;
        assert_eq!(log_b.next_non_presence().await.unwrap()["type"], "signed_in");

        node_b
            .coordinator
            .on_frame(&mut ctx_b, r#"{"type":"message","subject":"hi","content":"hello"}"#)
            .await;

        let on_a = log_a.next_non_presence().await.unwrap();
        assert_eq!(on_a["type"], "message");
        assert_eq!(on_a["subject"], "hi");
        assert_eq!(on_a["name"], "Bob");
        assert_eq!(on_a["email"], "bob@example.com");

        let on_b = log_b.next_non_presence().await.unwrap();
        assert_eq!(on_b["id"], on_a["id"]);
    }

    #[tokio::test]
    async fn run_connection_handles_frames_until_stream_ends() {
        let node = test_node(Arc::new(MemoryStore::new())).await;
        let (t, mut log) = recording_transport();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let inbound = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);

        let coordinator = Arc::clone(&node.coordinator);
        let session = tokio::spawn(async move { coordinator.run_connection(t, inbound).await });

        tx.send(r#"{"type":"ping"}"#.into()).unwrap();
        assert_eq!(log.next_non_presence().await.unwrap()["type"], "pong");
        assert_eq!(node.registry.count(), 1);

        drop(tx);
        session.await.unwrap();
        assert_eq!(node.registry.count(), 0);
        assert_eq!(node.presence.anonymous_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_connection_stops_when_registry_closes_it() {
        let node = test_node(Arc::new(MemoryStore::new())).await;
        let (t, _log) = recording_transport();
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let inbound = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);

        let coordinator = Arc::clone(&node.coordinator);
        let session = tokio::spawn(async move { coordinator.run_connection(t, inbound).await });
        while node.registry.count() == 0 {
            tokio::task::yield_now().await;
        }

        node.reconciler.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn connection_after_shutdown_is_not_counted() {
        let store = Arc::new(MemoryStore::new());
        let node = test_node(Arc::clone(&store)).await;
        node.reconciler.shutdown().await.unwrap();

        let (t, mut log) = recording_transport();
        assert!(node.coordinator.on_connect(t).await.is_none());
        assert_eq!(node.registry.count(), 0);
        assert_eq!(node.presence.anonymous_count().await.unwrap(), 0);
        assert_eq!(node.presence.shadow().await.anonymous, 0);
        assert!(log.next_raw().await.is_none());
    }
}
