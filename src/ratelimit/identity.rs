//! Client identity and counter key handling.

use std::fmt;
use std::net::IpAddr;

use super::window::{Window, WindowBounds};

/// The key a client is rate limited under, usually its IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Wrap an arbitrary identity string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the identity as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientIdentity {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key identifying one counter: a client within one concrete window.
///
/// The window length is part of the key so that processes configured with
/// different windows never share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The client being counted.
    pub identity: ClientIdentity,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Window start, Unix seconds.
    pub window_start: i64,
}

impl CounterKey {
    /// Create the key for `identity` in the window described by `bounds`.
    pub fn new(identity: &ClientIdentity, window: Window, bounds: &WindowBounds) -> Self {
        Self {
            identity: identity.clone(),
            window_secs: window.as_secs(),
            window_start: bounds.start,
        }
    }

    /// Unix second at which this counter's window ends.
    pub fn window_end(&self) -> i64 {
        self.window_start.saturating_add(self.window_secs as i64)
    }

    /// Render as a flat string key for external stores.
    /// Format: "{prefix}{identity}|{window_secs}|{window_start}"
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!(
            "{}{}|{}|{}",
            prefix, self.identity, self.window_secs, self.window_start
        )
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.identity, self.window_start, self.window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::window::{Clock, MockClock};

    #[test]
    fn test_identity_from_ip() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(ClientIdentity::from(ip).as_str(), "10.0.0.1");

        let v6: IpAddr = "::1".parse().unwrap();
        assert_eq!(ClientIdentity::from(v6).to_string(), "::1");
    }

    #[test]
    fn test_counter_key_store_format() {
        let window = Window::from_secs(3600).unwrap();
        let clock = MockClock::at_unix(1_704_067_200 + 42);
        let key = CounterKey::new(
            &ClientIdentity::new("10.0.0.1"),
            window,
            &window.bounds(clock.now()),
        );

        assert_eq!(key.window_start, 1_704_067_200);
        assert_eq!(key.window_end(), 1_704_070_800);
        assert_eq!(
            key.to_store_key("turnstile:"),
            "turnstile:10.0.0.1|3600|1704067200"
        );
    }

    #[test]
    fn test_counter_keys_differ_across_windows() {
        let window = Window::from_secs(60).unwrap();
        let identity = ClientIdentity::new("client");
        let clock = MockClock::at_unix(59);
        let first = CounterKey::new(&identity, window, &window.bounds(clock.now()));

        clock.advance(std::time::Duration::from_secs(1));
        let second = CounterKey::new(&identity, window, &window.bounds(clock.now()));

        assert_ne!(first, second);
    }
}
