pub mod auth;
pub mod config;
pub mod fanout;
pub mod node;
pub mod presence;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

#[cfg(test)]
mod testing;

pub use auth::{AuthError, JwtAuthenticator};
pub use config::{FleetKeys, ServerConfig};
pub use fanout::{FanoutBus, FanoutError};
pub use node::Node;
pub use presence::{PresenceCounter, PresenceShadow, ReconcileReport};
pub use registry::{Registry, Transport, TransportError};
pub use server::{start, ServerHandle};
pub use session::{ChatSendError, SessionContext, SessionCoordinator};
pub use shutdown::{termination_signal, ExitFlag, ShutdownReconciler, ShutdownReport};
