use std::sync::Arc;

use chorus_core::{Authenticator, ChatHistory};
use chorus_fleet::FleetStore;

use crate::config::ServerConfig;
use crate::fanout::{FanoutBus, FanoutError};
use crate::presence::PresenceCounter;
use crate::registry::Registry;
use crate::session::SessionCoordinator;
use crate::shutdown::{ExitFlag, ShutdownReconciler, ShutdownReport};

/// One server instance's coordination components, wired once at startup.
pub struct Node {
    pub registry: Arc<Registry>,
    pub bus: Arc<FanoutBus>,
    pub presence: Arc<PresenceCounter>,
    pub coordinator: Arc<SessionCoordinator>,
    pub reconciler: Arc<ShutdownReconciler>,
    pub history: Arc<dyn ChatHistory>,
}

impl Node {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn FleetStore>,
        auth: Arc<dyn Authenticator>,
        history: Arc<dyn ChatHistory>,
    ) -> Self {
        let keys = &config.keys;
        let registry = Arc::new(Registry::new(config.max_send_queue));
        let bus = Arc::new(FanoutBus::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            &keys.chat_channel,
            &keys.presence_channel,
            config.store_timeout,
        ));
        let presence = Arc::new(PresenceCounter::new(
            store,
            Arc::clone(&bus),
            keys,
            config.store_timeout,
        ));
        let exit = ExitFlag::default();
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&presence),
            Arc::clone(&bus),
            auth,
            Arc::clone(&history),
            exit.clone(),
            config.store_timeout,
        ));
        let reconciler = Arc::new(ShutdownReconciler::new(
            exit,
            Arc::clone(&registry),
            Arc::clone(&presence),
            Arc::clone(&bus),
            config.shutdown_grace,
        ));

        Self {
            registry,
            bus,
            presence,
            coordinator,
            reconciler,
            history,
        }
    }

    /// Join the fleet's fan-out channels.
    pub async fn start(&self) -> Result<(), FanoutError> {
        self.bus.start().await
    }

    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        self.reconciler.shutdown().await
    }
}
