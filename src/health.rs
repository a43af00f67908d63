//! Proxy health checking.

use std::collections::HashSet;
use std::time::Duration;

use log::{info, warn};

use crate::config::PoolConfig;
use crate::pool::ProxyPool;
use crate::proxy::Proxy;

/// Browser-like User-Agent sent on probes, so health-check endpoints treat us
/// like ordinary traffic.
pub(crate) const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Probes proxies for basic reachability (and optionally for reachability of
/// the scrape target) before they enter rotation.
pub struct HealthChecker {
    connectivity_url: String,
    target_url: Option<String>,
    timeout: Duration,
    probe_delay: Duration,
}

impl HealthChecker {
    /// Build a checker with explicit probe settings.
    pub fn new(
        connectivity_url: impl Into<String>,
        target_url: Option<String>,
        timeout: Duration,
        probe_delay: Duration,
    ) -> Self {
        Self {
            connectivity_url: connectivity_url.into(),
            target_url,
            timeout,
            probe_delay,
        }
    }

    /// Build a checker from pool configuration.
    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            config.health_check_url.clone(),
            config.target_url.clone(),
            config.health_check_timeout,
            config.probe_delay,
        )
    }

    /// Probe one proxy. Basic connectivity first, then the target URL when
    /// configured. Any non-200 response or transport error is a failure.
    pub async fn check(&self, proxy: &Proxy) -> bool {
        if !self.probe(proxy, &self.connectivity_url).await {
            return false;
        }
        match &self.target_url {
            Some(target) => self.probe(proxy, target).await,
            None => true,
        }
    }

    async fn probe(&self, proxy: &Proxy, url: &str) -> bool {
        let reqwest_proxy = match proxy.to_reqwest_proxy() {
            Ok(p) => p,
            Err(e) => {
                warn!("Invalid proxy {}: {}", proxy, e);
                return false;
            }
        };
        let client = match reqwest::Client::builder()
            .proxy(reqwest_proxy)
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build probe client for {}: {}", proxy, e);
                return false;
            }
        };
        matches!(client.get(url).send().await, Ok(resp) if resp.status().is_success())
    }

    /// Health-check every proxy in the pool, one at a time with a fixed delay
    /// between probes, and drop the ones that fail. Dropped proxies are not
    /// blacklisted: a failed probe may be a temporarily overloaded proxy,
    /// unlike a connect failure observed by the dispatcher. Survivors are
    /// persisted.
    pub async fn precheck(&self, pool: &ProxyPool) {
        let initial = pool.len();
        if initial == 0 {
            return;
        }
        info!("Health check: testing {} proxies", initial);

        let blacklist = pool.blacklist_snapshot();
        let mut survivors: HashSet<String> = HashSet::new();
        let candidates = pool.entries_snapshot();

        for (i, proxy) in candidates.iter().enumerate() {
            if blacklist.contains(&proxy.key()) {
                warn!("Proxy {} is blacklisted, skipping", proxy.key());
                continue;
            }
            if i > 0 {
                tokio::time::sleep(self.probe_delay).await;
            }
            if self.check(proxy).await {
                survivors.insert(proxy.key());
            } else {
                warn!("Proxy {}/{} failed health check: {}", i + 1, initial, proxy.key());
            }
        }

        pool.retain_keys(&survivors);
        let working = pool.len();
        if working < initial {
            info!("Health check: {}/{} proxies working", working, initial);
        } else {
            info!("Health check: all {} proxies working", initial);
        }
    }
}
