//! Configuration for the proxy pool and dispatcher.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a proxy pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Path to the persisted proxy list. `None` disables persistence.
    pub config_path: Option<PathBuf>,
    /// Path to the persisted blacklist. Defaults to a sibling of the proxy
    /// list named `proxy_blacklist.txt`.
    pub blacklist_path: Option<PathBuf>,
    /// Disable proxy usage entirely; the pool stays empty and every dispatch
    /// runs over the direct connection.
    pub disable_proxy: bool,
    /// Fetch fresh proxies from public sources when fewer than `min_working`
    /// proxies survive the startup health check.
    pub auto_refresh: bool,
    /// Minimum number of working proxies before auto-refresh kicks in.
    pub min_working: usize,
    /// Run the startup health check over loaded proxies.
    pub precheck: bool,
    /// How long a rate-limited proxy stays out of rotation.
    pub cooldown_ttl: Duration,
    /// URL used for basic connectivity probes.
    pub health_check_url: String,
    /// Optional domain-specific URL probed after basic connectivity passes.
    pub target_url: Option<String>,
    /// Timeout for health-check probes.
    pub health_check_timeout: Duration,
    /// Delay between consecutive health-check probes, so the probe endpoint's
    /// own rate limiting is not tripped.
    pub probe_delay: Duration,
    /// Default timeout for dispatched requests.
    pub request_timeout: Duration,
    /// Maximum requests per second routed through any single proxy.
    pub max_requests_per_second: f64,
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfigBuilder::new().build()
    }
}

/// Builder for `PoolConfig`.
pub struct PoolConfigBuilder {
    config_path: Option<PathBuf>,
    blacklist_path: Option<PathBuf>,
    disable_proxy: bool,
    auto_refresh: bool,
    min_working: Option<usize>,
    precheck: bool,
    cooldown_ttl: Option<Duration>,
    health_check_url: Option<String>,
    target_url: Option<String>,
    health_check_timeout: Option<Duration>,
    probe_delay: Option<Duration>,
    request_timeout: Option<Duration>,
    max_requests_per_second: Option<f64>,
}

impl PoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            config_path: None,
            blacklist_path: None,
            disable_proxy: false,
            auto_refresh: false,
            min_working: None,
            precheck: true,
            cooldown_ttl: None,
            health_check_url: None,
            target_url: None,
            health_check_timeout: None,
            probe_delay: None,
            request_timeout: None,
            max_requests_per_second: None,
        }
    }

    /// Set the path of the persisted proxy list.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Set the path of the persisted blacklist.
    pub fn blacklist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.blacklist_path = Some(path.into());
        self
    }

    /// Disable proxy usage entirely.
    pub fn disable_proxy(mut self, disable: bool) -> Self {
        self.disable_proxy = disable;
        self
    }

    /// Enable auto-refresh from public proxy sources on depletion.
    pub fn auto_refresh(mut self, refresh: bool) -> Self {
        self.auto_refresh = refresh;
        self
    }

    /// Set the minimum number of working proxies before auto-refresh.
    pub fn min_working(mut self, count: usize) -> Self {
        self.min_working = Some(count);
        self
    }

    /// Enable or disable the startup health check.
    pub fn precheck(mut self, precheck: bool) -> Self {
        self.precheck = precheck;
        self
    }

    /// Set the rate-limit cooldown duration.
    pub fn cooldown_ttl(mut self, ttl: Duration) -> Self {
        self.cooldown_ttl = Some(ttl);
        self
    }

    /// Set the URL used for basic connectivity probes.
    pub fn health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    /// Set a domain-specific URL probed after basic connectivity passes.
    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    /// Set the timeout for health-check probes.
    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = Some(timeout);
        self
    }

    /// Set the delay between consecutive health-check probes.
    pub fn probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    /// Set the default timeout for dispatched requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the maximum requests per second per proxy.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        PoolConfig {
            config_path: self.config_path,
            blacklist_path: self.blacklist_path,
            disable_proxy: self.disable_proxy,
            auto_refresh: self.auto_refresh,
            min_working: self.min_working.unwrap_or(5),
            precheck: self.precheck,
            cooldown_ttl: self.cooldown_ttl.unwrap_or(Duration::from_secs(600)),
            health_check_url: self
                .health_check_url
                .unwrap_or_else(|| "http://httpbin.org/ip".to_string()),
            target_url: self.target_url,
            health_check_timeout: self.health_check_timeout.unwrap_or(Duration::from_secs(10)),
            probe_delay: self.probe_delay.unwrap_or(Duration::from_millis(300)),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(30)),
            max_requests_per_second: self.max_requests_per_second.unwrap_or(5.0),
        }
    }
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
