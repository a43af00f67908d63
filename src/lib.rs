//! # rotating-fetch
//!
//! A resilient network access layer for scrapers: a rotating proxy pool with
//! health tracking and a request dispatcher that keeps making progress across
//! flaky proxies, 429 responses and transient outages.
//!
//! The pool rotates proxies round-robin, puts rate-limited proxies into a
//! temporary cooldown, permanently blacklists proxies with connection
//! failures, and persists both lists across runs. The dispatcher prefers
//! proxy rotation (Plan A) and falls back to a direct connection with
//! exponential backoff (Plan B). [`fetch_all`] runs many independent fetches
//! under a worker cap, aggregating partial failures instead of aborting.

pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod pool;
pub mod proxy;
pub mod sources;
pub mod store;

pub use batch::{fetch_all, BatchConfig};
pub use config::{PoolConfig, PoolConfigBuilder};
pub use dispatch::{recommended_delay, Dispatcher, RequestOptions, Response, Transport};
pub use error::{FetchError, FetchErrorKind, TransportError};
pub use health::HealthChecker;
pub use pool::{init_pool, PoolStats, ProxyPool};
pub use proxy::Proxy;
