use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::Level;

use chorus_fleet::{FleetStore, MemoryStore, RedisStore};
use chorus_server::{FleetKeys, JwtAuthenticator, Node, ServerConfig};
use chorus_store::{ChatRepo, Database};
use chorus_telemetry::TelemetryConfig;

#[derive(Parser, Debug)]
#[command(name = "chorus")]
#[command(about = "Horizontally scalable websocket chat server")]
#[command(version)]
struct Cli {
    /// HTTP listen port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Shared fleet store. Without it the server runs as a single instance.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "REDIS_MESSAGING_CHANNEL", default_value = "chat")]
    chat_channel: String,

    #[arg(long, env = "REDIS_USER_COUNT_CHANNEL", default_value = "user_count")]
    presence_channel: String,

    #[arg(long, env = "ANONYMOUS_USERS_REDIS_KEY", default_value = "anonymous_users")]
    anonymous_key: String,

    #[arg(long, env = "AUTHORIZED_USERS_REDIS_KEY", default_value = "authorized_users")]
    authorized_key: String,

    /// HS256 secret shared with the login service
    #[arg(long, env = "AUTH_PRIVATE_KEY", hide_env_values = true)]
    auth_secret: String,

    /// Chat history database (defaults to ~/.chorus/chat.db)
    #[arg(long, env = "CHORUS_DB_PATH")]
    db_path: Option<PathBuf>,

    #[arg(long, env = "CHORUS_STORE_TIMEOUT_MS", default_value_t = 3000)]
    store_timeout_ms: u64,

    #[arg(long, env = "CHORUS_MAILBOX_CAPACITY", default_value_t = 256)]
    mailbox_capacity: usize,

    #[arg(long, env = "CHORUS_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,

    #[arg(long, env = "CHORUS_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    #[arg(long, env = "CHORUS_LOG_JSON", default_value_t = true, action = clap::ArgAction::Set)]
    log_json: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            max_send_queue: self.mailbox_capacity,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            keys: FleetKeys {
                chat_channel: self.chat_channel.clone(),
                presence_channel: self.presence_channel.clone(),
                anonymous_key: self.anonymous_key.clone(),
                authorized_key: self.authorized_key.clone(),
            },
        }
    }

    fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| dirs_home().join(".chorus").join("chat.db"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    chorus_telemetry::init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.log_json,
        ..Default::default()
    });

    tracing::info!("Starting chorus");

    let db = Database::open(&cli.db_path()).context("failed to open chat history database")?;
    let history = Arc::new(ChatRepo::new(db));

    let store: Arc<dyn FleetStore> = match &cli.redis_url {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .context("failed to connect to redis")?,
        ),
        None => {
            tracing::warn!("REDIS_URL not set, running as a single instance");
            Arc::new(MemoryStore::new())
        }
    };

    let auth = Arc::new(JwtAuthenticator::new(cli.auth_secret.as_bytes()));
    let config = cli.server_config();
    let node = Arc::new(Node::new(&config, store, auth, history));
    node.start().await.context("failed to join fan-out channels")?;

    let handle = chorus_server::start(config, Arc::clone(&node))
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "Chorus server ready");

    chorus_server::termination_signal().await;

    handle.stop_accepting();
    if node.shutdown().await.is_none() {
        tracing::warn!("Shutdown did not finish cleanly");
    }
    handle.stop().await;
    tracing::info!("Stopped");
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
