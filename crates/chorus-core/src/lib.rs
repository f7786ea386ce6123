pub mod auth;
pub mod errors;
pub mod events;
pub mod frames;
pub mod history;
pub mod ids;

pub use auth::{AuthOutcome, Authenticator, Identity};
pub use errors::HistoryError;
pub use events::{ChatEvent, NewChat, PresenceEvent};
pub use frames::{InboundFrame, OutboundFrame};
pub use history::ChatHistory;
pub use ids::{ConnectionId, MessageId};
