//! Configuration management for Turnstile.
//!
//! Settings are layered: an optional YAML file, then environment variables
//! (`PORT`, `RATE_LIMIT`, ...), then command line overrides applied by the
//! binary. The raw [`ServiceConfig`] is checked by [`ServiceConfig::validate`]
//! into [`Settings`], which is what the rest of the service consumes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{FailureMode, FallbackPolicy, Threshold, Window};

/// Raw service configuration, as read from file and environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address to bind the HTTP listener to
    #[serde(default = "default_listen_host")]
    pub listen_host: IpAddr,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Counter store address: `memory`, a `redis://` URL, or a bare `host:port`
    #[serde(default)]
    pub store_addr: Option<String>,

    /// Static threshold (requests per window)
    #[serde(default)]
    pub rate_limit: Option<RawLimit>,

    /// Flag key holding the threshold in the remote flag service
    #[serde(default)]
    pub flag_source_key: Option<String>,

    /// Base URL of the remote flag service
    #[serde(default)]
    pub flag_source_url: Option<String>,

    /// Timeout for one flag lookup, in milliseconds
    #[serde(default = "default_flag_timeout_ms")]
    pub flag_timeout_ms: u64,

    /// How long a fetched flag value is served before refetching, in seconds
    #[serde(default = "default_flag_refresh_secs")]
    pub flag_refresh_secs: u64,

    /// Behaviour when the flag lookup fails
    #[serde(default)]
    pub flag_fallback: FallbackPolicy,

    /// Counting window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Trust `X-Forwarded-For` / `X-Real-IP` for the client address.
    /// Only enable behind a proxy that overwrites these headers.
    #[serde(default)]
    pub trust_proxy: bool,

    /// Behaviour when the counter store is unreachable
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// A threshold as written in config, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLimit {
    Number(i64),
    Text(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            port: default_port(),
            store_addr: None,
            rate_limit: None,
            flag_source_key: None,
            flag_source_url: None,
            flag_timeout_ms: default_flag_timeout_ms(),
            flag_refresh_secs: default_flag_refresh_secs(),
            flag_fallback: FallbackPolicy::default(),
            window_secs: default_window_secs(),
            trust_proxy: false,
            failure_mode: FailureMode::default(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_listen_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_flag_timeout_ms() -> u64 {
    300
}

fn default_flag_refresh_secs() -> u64 {
    30
}

fn default_window_secs() -> u64 {
    3600
}

/// Where counters live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// In this process only
    Memory,
    /// Shared Redis server at the given URL
    Redis(String),
}

/// Where the threshold comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThresholdSource {
    /// Fixed at startup
    Static(Threshold),
    /// Read from a remote flag service
    Flag {
        key: String,
        url: String,
        timeout: Duration,
        refresh_interval: Duration,
        fallback: FallbackPolicy,
    },
}

/// Validated settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub store: StoreBackend,
    pub threshold: ThresholdSource,
    pub window: Window,
    pub trust_proxy: bool,
    pub failure_mode: FailureMode,
    pub log_format: LogFormat,
}

impl ServiceConfig {
    /// Load configuration from an optional YAML file overlaid with the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::layered(path, config::Environment::default())
    }

    fn layered(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Check the configuration and resolve it into typed settings.
    pub fn validate(&self) -> Result<Settings> {
        let threshold = match (&self.rate_limit, &self.flag_source_key) {
            (Some(limit), None) => ThresholdSource::Static(parse_limit(limit)?),
            (None, Some(key)) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(TurnstileError::Config("FLAG_SOURCE_KEY is empty".into()));
                }
                let url = self
                    .flag_source_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        TurnstileError::Config(
                            "FLAG_SOURCE_URL is required when FLAG_SOURCE_KEY is set".into(),
                        )
                    })?;
                if self.flag_timeout_ms == 0 {
                    return Err(TurnstileError::Config(
                        "FLAG_TIMEOUT_MS must be positive".into(),
                    ));
                }
                ThresholdSource::Flag {
                    key: key.to_string(),
                    url: url.to_string(),
                    timeout: Duration::from_millis(self.flag_timeout_ms),
                    refresh_interval: Duration::from_secs(self.flag_refresh_secs),
                    fallback: self.flag_fallback,
                }
            }
            (Some(_), Some(_)) => {
                return Err(TurnstileError::Config(
                    "set exactly one of RATE_LIMIT or FLAG_SOURCE_KEY, not both".into(),
                ))
            }
            (None, None) => {
                return Err(TurnstileError::Config(
                    "one of RATE_LIMIT or FLAG_SOURCE_KEY is required".into(),
                ))
            }
        };

        Ok(Settings {
            listen_addr: SocketAddr::new(self.listen_host, self.port),
            store: parse_store_addr(self.store_addr.as_deref())?,
            threshold,
            window: Window::from_secs(self.window_secs)?,
            trust_proxy: self.trust_proxy,
            failure_mode: self.failure_mode,
            log_format: self.log_format,
        })
    }
}

fn parse_limit(raw: &RawLimit) -> Result<Threshold> {
    match raw {
        RawLimit::Number(n) => Threshold::positive(*n).ok_or_else(|| {
            TurnstileError::Config(format!("RATE_LIMIT must be a positive integer, got {}", n))
        }),
        RawLimit::Text(s) => s.parse(),
    }
}

fn parse_store_addr(raw: Option<&str>) -> Result<StoreBackend> {
    let addr = match raw.map(str::trim) {
        None | Some("") => return Ok(StoreBackend::Memory),
        Some(addr) if addr.eq_ignore_ascii_case("memory") => return Ok(StoreBackend::Memory),
        Some(addr) => addr,
    };

    if addr.starts_with("redis://") || addr.starts_with("rediss://") {
        Ok(StoreBackend::Redis(addr.to_string()))
    } else if addr.contains("://") {
        Err(TurnstileError::Config(format!(
            "unsupported STORE_ADDR scheme: {}",
            addr
        )))
    } else {
        Ok(StoreBackend::Redis(format!("redis://{}", addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Environment source reading only `vars`, never the process environment.
    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<config::Map<_, _>>();
        config::Environment::default().source(Some(vars))
    }

    fn config(yaml: &str) -> ServiceConfig {
        ServiceConfig::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.window_secs, 3600);
        assert!(!cfg.trust_proxy);
        assert_eq!(cfg.failure_mode, FailureMode::Propagate);
        // No threshold source configured
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_static_threshold_config() {
        let settings = config("port: 9000\nrate_limit: 3\n").validate().unwrap();
        assert_eq!(settings.listen_addr.port(), 9000);
        assert_eq!(settings.threshold, ThresholdSource::Static(Threshold::new(3)));
        assert_eq!(settings.store, StoreBackend::Memory);
        assert_eq!(settings.window, Window::HOUR);
    }

    #[test]
    fn test_static_threshold_as_string() {
        let settings = config("rate_limit: \"25\"\n").validate().unwrap();
        assert_eq!(settings.threshold, ThresholdSource::Static(Threshold::new(25)));
    }

    #[test]
    fn test_invalid_static_threshold_fails_fast() {
        for yaml in ["rate_limit: 0\n", "rate_limit: -5\n", "rate_limit: lots\n"] {
            let result = config(yaml).validate();
            assert!(
                matches!(result, Err(TurnstileError::Config(_))),
                "{} should be rejected",
                yaml.trim()
            );
        }
    }

    #[test]
    fn test_flag_threshold_config() {
        let yaml = r#"
flag_source_key: ping-rate-limit
flag_source_url: http://flags.internal:8500
flag_timeout_ms: 250
flag_fallback: fail
"#;
        let settings = config(yaml).validate().unwrap();
        match settings.threshold {
            ThresholdSource::Flag {
                key,
                url,
                timeout,
                refresh_interval,
                fallback,
            } => {
                assert_eq!(key, "ping-rate-limit");
                assert_eq!(url, "http://flags.internal:8500");
                assert_eq!(timeout, Duration::from_millis(250));
                assert_eq!(refresh_interval, Duration::from_secs(30));
                assert_eq!(fallback, FallbackPolicy::Fail);
            }
            other => panic!("expected flag source, got {:?}", other),
        }
    }

    #[test]
    fn test_flag_key_requires_url() {
        let result = config("flag_source_key: ping-rate-limit\n").validate();
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_exactly_one_threshold_source() {
        let yaml = "rate_limit: 5\nflag_source_key: k\nflag_source_url: http://flags\n";
        let result = config(yaml).validate();
        assert!(matches!(result, Err(TurnstileError::Config(msg)) if msg.contains("exactly one")));
    }

    #[test]
    fn test_store_addr_forms() {
        assert_eq!(parse_store_addr(None).unwrap(), StoreBackend::Memory);
        assert_eq!(parse_store_addr(Some("memory")).unwrap(), StoreBackend::Memory);
        assert_eq!(
            parse_store_addr(Some("localhost:6379")).unwrap(),
            StoreBackend::Redis("redis://localhost:6379".into())
        );
        assert_eq!(
            parse_store_addr(Some("rediss://cache:6380/0")).unwrap(),
            StoreBackend::Redis("rediss://cache:6380/0".into())
        );
        assert!(parse_store_addr(Some("memcached://cache:11211")).is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let result = config("rate_limit: 5\nwindow_secs: 0\n").validate();
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_enum_settings() {
        let settings = config("rate_limit: 5\nfailure_mode: closed\nlog_format: json\ntrust_proxy: true\n")
            .validate()
            .unwrap();
        assert_eq!(settings.failure_mode, FailureMode::Closed);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert!(settings.trust_proxy);
    }

    #[test]
    fn test_load_reads_yaml_file() {
        let path = std::env::temp_dir().join(format!("turnstile-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "rate_limit: 42\nwindow_secs: 120\n").unwrap();

        let cfg = ServiceConfig::layered(Some(&path), env(&[])).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.rate_limit, Some(RawLimit::Number(42)));
        assert_eq!(cfg.window_secs, 120);
    }

    #[test]
    fn test_load_reads_environment() {
        let cfg = ServiceConfig::layered(
            None,
            env(&[
                ("PORT", "9123"),
                ("RATE_LIMIT", "7"),
                ("STORE_ADDR", "redis://cache:6379"),
                ("TRUST_PROXY", "true"),
                ("FAILURE_MODE", "closed"),
            ]),
        )
        .unwrap();

        assert_eq!(cfg.port, 9123);
        assert_eq!(cfg.rate_limit, Some(RawLimit::Text("7".into())));

        let settings = cfg.validate().unwrap();
        assert_eq!(settings.listen_addr.port(), 9123);
        assert_eq!(settings.threshold, ThresholdSource::Static(Threshold::new(7)));
        assert_eq!(settings.store, StoreBackend::Redis("redis://cache:6379".into()));
        assert!(settings.trust_proxy);
        assert_eq!(settings.failure_mode, FailureMode::Closed);
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = std::env::temp_dir().join(format!("turnstile-override-{}.yaml", std::process::id()));
        std::fs::write(&path, "rate_limit: 42
window_secs: 120
").unwrap();

        let cfg = ServiceConfig::layered(Some(&path), env(&[("WINDOW_SECS", "60")])).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.rate_limit, Some(RawLimit::Number(42)));
        assert_eq!(cfg.window_secs, 60);
    }
}
