//! Fakes shared by the unit tests in this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use chorus_core::{AuthOutcome, Authenticator, ChatEvent, ChatHistory, HistoryError, NewChat};
use chorus_fleet::MemoryStore;
use chorus_store::{ChatRepo, Database};

use crate::config::ServerConfig;
use crate::node::Node;
use crate::registry::{Transport, TransportError};

const WAIT: Duration = Duration::from_millis(500);

/// Transport that records every written frame.
pub struct RecordingTransport {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(text)
            .map_err(|_| TransportError("recorder dropped".into()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FrameLog {
    rx: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl FrameLog {
    /// Next written frame, or `None` if nothing arrives in time.
    pub async fn next_raw(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.rx.recv()).await.ok().flatten()
    }

    pub async fn next_frame(&mut self) -> serde_json::Value {
        let raw = self.next_raw().await.expect("no frame arrived");
        serde_json::from_str(&raw).expect("frame is not json")
    }

    /// Next frame that is not a `user_count` broadcast.
    pub async fn next_non_presence(&mut self) -> Option<serde_json::Value> {
        loop {
            let raw = self.next_raw().await?;
            let frame: serde_json::Value = serde_json::from_str(&raw).expect("frame is not json");
            if frame["type"] != "user_count" {
                return Some(frame);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn recording_transport() -> (RecordingTransport, FrameLog) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        RecordingTransport {
            tx,
            closed: Arc::clone(&closed),
        },
        FrameLog { rx, closed },
    )
}

/// Transport whose writes never complete.
pub struct StalledTransport;

#[async_trait]
impl Transport for StalledTransport {
    async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn close(&mut self) {}
}

/// Transport whose first write fails, as if the peer vanished.
pub struct FailingTransport;

#[async_trait]
impl Transport for FailingTransport {
    async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
        Err(TransportError("broken pipe".into()))
    }

    async fn close(&mut self) {}
}

/// Token -> outcome table. Unknown tokens are absent.
#[derive(Clone, Default)]
pub struct StaticAuth {
    outcomes: HashMap<String, AuthOutcome>,
}

impl StaticAuth {
    pub fn with(mut self, token: &str, outcome: AuthOutcome) -> Self {
        self.outcomes.insert(token.to_string(), outcome);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuth {
    async fn verify(&self, token: &str) -> AuthOutcome {
        self.outcomes
            .get(token)
            .cloned()
            .unwrap_or(AuthOutcome::Absent)
    }
}

/// In-memory SQLite history that can be told to fail.
#[derive(Clone)]
pub struct FlakyHistory {
    repo: ChatRepo,
    failing: Arc<AtomicBool>,
}

impl FlakyHistory {
    pub fn new() -> Self {
        Self {
            repo: ChatRepo::new(Database::in_memory().expect("in-memory db")),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatHistory for FlakyHistory {
    async fn persist_chat(&self, chat: NewChat) -> Result<ChatEvent, HistoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HistoryError::Unavailable("history offline".into()));
        }
        self.repo.persist_chat(chat).await
    }

    async fn page_messages(&self, before_ts: i64) -> Result<Vec<ChatEvent>, HistoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HistoryError::Unavailable("history offline".into()));
        }
        self.repo.page_messages(before_ts).await
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        max_send_queue: 64,
        store_timeout: Duration::from_secs(1),
        shutdown_grace: Duration::from_secs(5),
        ..Default::default()
    }
}

/// A started node on `store` with no valid tokens.
pub async fn test_node(store: Arc<MemoryStore>) -> Node {
    test_node_with(store, StaticAuth::default(), FlakyHistory::new()).await
}

pub async fn test_node_with(store: Arc<MemoryStore>, auth: StaticAuth, history: FlakyHistory) -> Node {
    let node = Node::new(&test_config(), store, Arc::new(auth), Arc::new(history));
    node.start().await.expect("fan-out bus starts");
    node
}
