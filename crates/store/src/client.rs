//! Redis-backed state store for deployments where several processes share
//! one learning state.

use crate::StateStore;
use adaptive_core::config::StoreConfig;
use adaptive_core::{EngineError, EngineResult};
use redis::Commands;
use std::time::Duration;
use tracing::{debug, info};

pub struct RedisStore {
    client: redis::Client,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis and verify the server answers `PING`.
    pub fn connect(config: &StoreConfig) -> EngineResult<Self> {
        info!(url = %config.redis_url, "Connecting to Redis state store");

        let client = redis::Client::open(config.redis_url.as_str()).map_err(store_error)?;
        let timeout = Duration::from_millis(config.connect_timeout_ms);

        let mut conn = client
            .get_connection_with_timeout(timeout)
            .map_err(store_error)?;
        let pong: String = redis::cmd("PING").query(&mut conn).map_err(store_error)?;
        info!(response = %pong, "Redis connection established");

        Ok(Self { client, timeout })
    }

    fn connection(&self) -> EngineResult<redis::Connection> {
        self.client
            .get_connection_with_timeout(self.timeout)
            .map_err(store_error)
    }
}

impl StateStore for RedisStore {
    fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut conn = self.connection()?;
        let data: Option<String> = conn.get(key).map_err(store_error)?;
        if data.is_none() {
            debug!(key = key, "No snapshot stored under key");
        }
        Ok(data)
    }

    fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut conn = self.connection()?;
        conn.set::<_, _, ()>(key, value).map_err(store_error)?;
        Ok(())
    }
}

fn store_error(err: redis::RedisError) -> EngineError {
    EngineError::Store(err.to_string())
}
