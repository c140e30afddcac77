//! Turnstile - per-client rate limited HTTP service
//!
//! Every request to the limited endpoints is counted against the caller's
//! IP address in a fixed time window. The per-window threshold comes either
//! from static configuration or from a remote feature-flag service, and the
//! counters live in memory or in Redis so several instances can share them.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod telemetry;
