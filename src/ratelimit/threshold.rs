//! Threshold providers.
//!
//! A [`ThresholdProvider`] answers "how many requests per window may this
//! client make". The static provider is fixed at startup; the dynamic one
//! reads a numeric flag from a remote flag service and caches it.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::identity::ClientIdentity;
use crate::error::{Result, TurnstileError};

/// Requests allowed per window.
///
/// Zero is representable so that providers can express "deny everything";
/// configuration and flag parsing only ever produce positive values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Threshold(u64);

impl Threshold {
    /// Wrap a raw limit.
    pub const fn new(limit: u64) -> Self {
        Self(limit)
    }

    /// Validate a configured or remotely supplied limit.
    pub fn positive(limit: i64) -> Option<Self> {
        u64::try_from(limit).ok().filter(|&l| l > 0).map(Self)
    }

    /// Parse a flag value. Accepts a JSON integer or a string holding one;
    /// anything else, or a value below one, is rejected.
    pub fn from_flag_value(value: &Value) -> Result<Self> {
        let parsed = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };

        parsed.and_then(Self::positive).ok_or_else(|| {
            TurnstileError::ThresholdSource(format!(
                "flag value {} is not a positive integer",
                value
            ))
        })
    }

    /// The raw limit.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Threshold {
    type Err = TurnstileError;

    /// Parse a configured limit, failing on anything unparseable or below one.
    fn from_str(raw: &str) -> Result<Self> {
        raw.trim()
            .parse::<i64>()
            .ok()
            .and_then(Threshold::positive)
            .ok_or_else(|| {
                TurnstileError::Config(format!(
                    "RATE_LIMIT must be a positive integer, got {:?}",
                    raw
                ))
            })
    }
}

/// Supplies the limit for a client.
#[async_trait]
pub trait ThresholdProvider: Send + Sync {
    /// Current threshold for `identity`.
    async fn threshold(&self, identity: &ClientIdentity) -> Result<Threshold>;
}

/// A threshold fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct StaticThreshold {
    threshold: Threshold,
}

impl StaticThreshold {
    /// Wrap an already validated threshold.
    pub fn new(threshold: Threshold) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl ThresholdProvider for StaticThreshold {
    async fn threshold(&self, _identity: &ClientIdentity) -> Result<Threshold> {
        Ok(self.threshold)
    }
}

/// A remote source of flag values.
#[async_trait]
pub trait FlagSource: Send + Sync {
    /// Fetch the raw value of flag `key`.
    async fn fetch(&self, key: &str) -> Result<Value>;
}

/// Flag source speaking plain HTTP: `GET {base_url}/flags/{key}`.
///
/// The key is sent as a single path segment, percent-encoded. The response
/// body is JSON, either the bare flag value or an object with a `value`
/// field.
#[derive(Debug, Clone)]
pub struct HttpFlagSource {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpFlagSource {
    /// Create a source for the given base URL. `timeout` bounds each request.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                TurnstileError::Config(format!("invalid flag service URL {:?}", base_url))
            })?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("turnstile/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TurnstileError::Config(format!("failed to build flag client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    fn flag_url(&self, key: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TurnstileError::ThresholdSource("flag service URL has no path".into()))?
            .pop_if_empty()
            .push("flags")
            .push(key);
        Ok(url)
    }
}

#[async_trait]
impl FlagSource for HttpFlagSource {
    async fn fetch(&self, key: &str) -> Result<Value> {
        let response = self
            .client
            .get(self.flag_url(key)?)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TurnstileError::ThresholdSource(format!("flag request failed: {}", e)))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| TurnstileError::ThresholdSource(format!("flag body unreadable: {}", e)))?;

        Ok(match body {
            Value::Object(mut map) if map.contains_key("value") => {
                map.remove("value").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}

/// What to do when the flag source fails or returns a bad value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Keep serving the last value that parsed; fail only if there is none.
    #[default]
    LastKnownGood,
    /// Fail the request.
    Fail,
}

/// Settings for [`DynamicThreshold`].
#[derive(Debug, Clone)]
pub struct DynamicThresholdConfig {
    /// Flag holding the limit.
    pub flag_key: String,
    /// Upper bound on one remote lookup.
    pub timeout: Duration,
    /// How long a fetched value is served before it is fetched again.
    pub refresh_interval: Duration,
    /// Behaviour on lookup failure.
    pub fallback: FallbackPolicy,
}

impl DynamicThresholdConfig {
    /// Defaults for `flag_key`: 300ms timeout, 30s refresh, last-known-good.
    pub fn new(flag_key: impl Into<String>) -> Self {
        Self {
            flag_key: flag_key.into(),
            timeout: Duration::from_millis(300),
            refresh_interval: Duration::from_secs(30),
            fallback: FallbackPolicy::LastKnownGood,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    threshold: Threshold,
    fetched_at: Instant,
}

/// Result of the most recent remote lookup, shared with callers that
/// waited on it.
#[derive(Debug, Default)]
struct Refresh {
    outcome: Option<std::result::Result<Threshold, String>>,
}

/// Threshold read from a remote flag, cached for `refresh_interval`.
///
/// At most one lookup is in flight; callers arriving while it runs take its
/// outcome instead of issuing their own.
pub struct DynamicThreshold {
    source: Arc<dyn FlagSource>,
    config: DynamicThresholdConfig,
    snapshot: RwLock<Option<Snapshot>>,
    refresh: Mutex<Refresh>,
    attempts: AtomicU64,
}

impl fmt::Debug for DynamicThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicThreshold")
            .field("config", &self.config)
            .field("snapshot", &*self.snapshot.read())
            .finish_non_exhaustive()
    }
}

impl DynamicThreshold {
    /// Create a provider reading from `source`.
    pub fn new(source: Arc<dyn FlagSource>, config: DynamicThresholdConfig) -> Self {
        Self {
            source,
            config,
            snapshot: RwLock::new(None),
            refresh: Mutex::new(Refresh::default()),
            attempts: AtomicU64::new(0),
        }
    }

    /// The last value that parsed, if any.
    pub fn last_known_good(&self) -> Option<Threshold> {
        (*self.snapshot.read()).map(|s| s.threshold)
    }

    async fn fetch(&self) -> Result<Threshold> {
        let key = &self.config.flag_key;
        let value = tokio::time::timeout(self.config.timeout, self.source.fetch(key))
            .await
            .map_err(|_| {
                TurnstileError::ThresholdSource(format!(
                    "flag {} lookup timed out after {:?}",
                    key, self.config.timeout
                ))
            })??;

        Threshold::from_flag_value(&value)
    }

    fn fresh(&self) -> Option<Threshold> {
        let cached = *self.snapshot.read();
        cached
            .filter(|s| s.fetched_at.elapsed() < self.config.refresh_interval)
            .map(|s| s.threshold)
    }

    async fn reload(&self) -> Result<Threshold> {
        match self.fetch().await {
            Ok(threshold) => {
                let previous = self.last_known_good();
                if previous != Some(threshold) {
                    info!(
                        flag = %self.config.flag_key,
                        threshold = %threshold,
                        previous = ?previous.map(|t| t.get()),
                        "Threshold updated from flag source"
                    );
                } else {
                    debug!(flag = %self.config.flag_key, "Threshold refreshed, unchanged");
                }
                *self.snapshot.write() = Some(Snapshot {
                    threshold,
                    fetched_at: Instant::now(),
                });
                Ok(threshold)
            }
            Err(error) => self.fallback(error),
        }
    }

    fn fallback(&self, error: TurnstileError) -> Result<Threshold> {
        match (self.config.fallback, self.last_known_good()) {
            (FallbackPolicy::LastKnownGood, Some(threshold)) => {
                warn!(
                    flag = %self.config.flag_key,
                    error = %error,
                    threshold = %threshold,
                    "Flag lookup failed, serving last known good threshold"
                );
                // Back off until the next refresh instead of retrying every request
                *self.snapshot.write() = Some(Snapshot {
                    threshold,
                    fetched_at: Instant::now(),
                });
                Ok(threshold)
            }
            _ => {
                warn!(flag = %self.config.flag_key, error = %error, "Flag lookup failed");
                Err(error)
            }
        }
    }
}

#[async_trait]
impl ThresholdProvider for DynamicThreshold {
    async fn threshold(&self, _identity: &ClientIdentity) -> Result<Threshold> {
        if let Some(threshold) = self.fresh() {
            return Ok(threshold);
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let mut refresh = self.refresh.lock().await;

        // Someone else finished a lookup while we waited; share its outcome.
        if self.attempts.load(Ordering::Acquire) != seen {
            if let Some(outcome) = refresh.outcome.clone() {
                return outcome.map_err(TurnstileError::ThresholdSource);
            }
        }
        if let Some(threshold) = self.fresh() {
            return Ok(threshold);
        }

        let result = self.reload().await;
        refresh.outcome = Some(match &result {
            Ok(threshold) => Ok(*threshold),
            Err(TurnstileError::ThresholdSource(msg)) => Err(msg.clone()),
            Err(error) => Err(error.to_string()),
        });
        self.attempts.fetch_add(1, Ordering::AcqRel);
        result
    }
}
