//! Redis-backed counter store.
//!
//! Lets several Turnstile processes share one set of counters. Each
//! increment is a single Lua script (`INCR` plus `EXPIRE` on first hit) so it
//! is atomic on the server, and elapsed windows are reclaimed by Redis TTL.
//!
//! The connection is opened lazily and shared once established; the
//! manager reconnects on its own after that. Waiting for the connection
//! counts against the operation timeout, so an unreachable server surfaces as
//! [`TurnstileError::StoreUnavailable`] within `op_timeout` on every request
//! rather than stopping the process.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::identity::{ClientIdentity, CounterKey};
use super::store::{WindowCount, WindowCounterStore};
use super::window::{Clock, SystemClock, Window};
use crate::error::{Result, TurnstileError};

/// Atomic increment; the TTL is only set when the key is created.
const INCREMENT_SCRIPT: &str = r#"
    local count = redis.call('INCR', KEYS[1])
    if count == 1 then
        redis.call('EXPIRE', KEYS[1], ARGV[1])
    end
    return count
"#;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every counter key (default: "turnstile:")
    pub key_prefix: String,
    /// Upper bound on a single Redis round trip, connecting included
    pub op_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "turnstile:".to_string(),
            op_timeout: Duration::from_millis(500),
        }
    }
}

/// Counter store shared through Redis.
pub struct RedisCounterStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
    config: RedisStoreConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Create a store for the given Redis URL with default configuration.
    ///
    /// Only the URL is validated here; no connection is made until the first
    /// request.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RedisStoreConfig::default(), Arc::new(SystemClock))
    }

    /// Create a store with custom configuration and clock.
    pub fn with_config(url: &str, config: RedisStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| TurnstileError::Config(format!("invalid Redis address {}: {}", url, e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(INCREMENT_SCRIPT),
            config,
            clock,
        })
    }

    /// Get a live connection, opening one if needed.
    ///
    /// Only one caller connects at a time; the others wait on it, and the
    /// whole wait is bounded by `op_timeout`.
    async fn connection(&self) -> Result<ConnectionManager> {
        let connect = self.connection.get_or_try_init(|| async {
            let conn = ConnectionManager::new(self.client.clone())
                .await
                .map_err(|e| {
                    warn!(error = %e, "Failed to connect to Redis");
                    TurnstileError::StoreUnavailable(e.to_string())
                })?;
            debug!("Connected to Redis counter store");
            Ok::<_, TurnstileError>(conn)
        });

        let conn = tokio::time::timeout(self.config.op_timeout, connect)
            .await
            .map_err(|_| TurnstileError::StoreUnavailable("timed out connecting to Redis".into()))??;
        Ok(conn.clone())
    }

    /// Run one Redis operation under the configured timeout.
    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(error = %e, op = op, "Redis operation failed");
                Err(TurnstileError::StoreUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(op = op, "Redis operation timed out");
                Err(TurnstileError::StoreUnavailable(format!("{} timed out", op)))
            }
        }
    }
}

#[async_trait]
impl WindowCounterStore for RedisCounterStore {
    async fn increment_and_check(
        &self,
        identity: &ClientIdentity,
        window: Window,
    ) -> Result<WindowCount> {
        let bounds = window.bounds(self.clock.now());
        let key = CounterKey::new(identity, window, &bounds).to_store_key(&self.config.key_prefix);
        let ttl_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);

        let mut conn = self.connection().await?;
        let mut invocation = self.script.key(&key);
        invocation.arg(ttl_secs);
        let count: u64 = self
            .bounded("increment", invocation.invoke_async(&mut conn))
            .await?;

        Ok(WindowCount {
            count,
            reset_at: bounds.reset_at,
        })
    }

    async fn current(&self, identity: &ClientIdentity, window: Window) -> Result<WindowCount> {
        let bounds = window.bounds(self.clock.now());
        let key = CounterKey::new(identity, window, &bounds).to_store_key(&self.config.key_prefix);

        let mut conn = self.connection().await?;
        let count: Option<u64> = self.bounded("get", conn.get(&key)).await?;

        Ok(WindowCount {
            count: count.unwrap_or(0),
            reset_at: bounds.reset_at,
        })
    }
}
