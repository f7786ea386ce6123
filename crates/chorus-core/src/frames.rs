//! JSON frames exchanged with clients over the websocket.

use serde::{Deserialize, Serialize};

use crate::events::{ChatEvent, PresenceEvent};

/// Client -> server frames.
///
/// Unknown `type` values decode to [`InboundFrame::Unknown`] so newer clients
/// never break older servers.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Ping,
    Auth {
        #[serde(default)]
        content: String,
    },
    Message {
        #[serde(default)]
        subject: String,
        #[serde(default)]
        content: String,
    },
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Server -> client frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Pong,
    Refresh,
    SignedIn,
    MessageFailed,
    Message(ChatEvent),
    UserCount(PresenceEvent),
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
