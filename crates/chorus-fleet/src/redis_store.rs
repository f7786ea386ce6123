use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::Client;

use crate::error::FleetError;
use crate::store::{FleetStore, Subscription};

/// Fleet store backed by a Redis server shared by every instance.
///
/// Commands go over one multiplexed connection; each subscription gets its
/// own dedicated connection, as Redis requires.
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, FleetError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        tracing::info!("Connected to shared redis store");
        Ok(Self { client, conn })
    }

    async fn int_cmd(&self, cmd: &mut redis::Cmd) -> Result<i64, FleetError> {
        let mut conn = self.conn.clone();
        Ok(cmd.query_async::<_, i64>(&mut conn).await?)
    }
}

#[async_trait]
impl FleetStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn incr(&self, key: &str) -> Result<i64, FleetError> {
        self.int_cmd(redis::cmd("INCR").arg(key)).await
    }

    async fn decr(&self, key: &str) -> Result<i64, FleetError> {
        self.int_cmd(redis::cmd("DECR").arg(key)).await
    }

    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, FleetError> {
        self.int_cmd(redis::cmd("DECRBY").arg(key).arg(amount)).await
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>, FleetError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        raw.map(|s| {
            s.parse::<i64>().map_err(|e| FleetError::NotAnInteger {
                key: key.to_string(),
                detail: e.to_string(),
            })
        })
        .transpose()
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, FleetError> {
        self.int_cmd(redis::cmd("HINCRBY").arg(key).arg(field).arg(delta))
            .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), FleetError> {
        self.int_cmd(redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(())
    }

    async fn hlen(&self, key: &str) -> Result<i64, FleetError> {
        self.int_cmd(redis::cmd("HLEN").arg(key)).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), FleetError> {
        let receivers = self
            .int_cmd(redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await?;
        tracing::trace!(channel, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, FleetError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;
        tracing::info!(channel, "Subscribed to redis channel");

        let channel_name = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let decoded = msg.get_payload::<String>();
            let channel_name = channel_name.clone();
            async move {
                match decoded {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(channel = %channel_name, error = %e, "Dropping non-text pub/sub payload");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
