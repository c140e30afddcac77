//! Rate limiting logic and state management.

mod identity;
mod limiter;
mod redis_store;
mod store;
mod threshold;
mod window;

pub use identity::{ClientIdentity, CounterKey};
pub use limiter::{FailureMode, QuotaStatus, RateLimiter, Verdict};
pub use redis_store::{RedisCounterStore, RedisStoreConfig};
pub use store::{MemoryCounterStore, WindowCount, WindowCounterStore};
pub use threshold::{
    DynamicThreshold, DynamicThresholdConfig, FallbackPolicy, FlagSource, HttpFlagSource,
    StaticThreshold, Threshold, ThresholdProvider,
};
pub use window::{Clock, SystemClock, Window, WindowBounds};
