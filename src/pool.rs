//! Rotating proxy pool with blacklist and rate-limit cooldowns.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{info, warn};
use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::health::HealthChecker;
use crate::proxy::Proxy;
use crate::sources;
use crate::store::PoolStore;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Counters reported to the CLI/config layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Proxies currently in rotation.
    pub total: usize,
    /// Keys permanently excluded.
    pub blacklisted: usize,
    /// Proxies currently in rate-limit cooldown.
    pub cooling: usize,
    /// Proxies in rotation and not cooling.
    pub available: usize,
}

/// Mutable rotation state, guarded as one unit so `next`, `mark_failed` and
/// `mark_rate_limited` cannot interleave.
struct PoolState {
    entries: Vec<Proxy>,
    cursor: usize,
    blacklist: HashSet<String>,
    /// Proxy key -> time of the most recent 429 through that proxy.
    cooldowns: HashMap<String, Instant>,
}

impl PoolState {
    /// Drop cooldown entries older than the TTL.
    fn purge_expired(&mut self, ttl: std::time::Duration) {
        let now = Instant::now();
        self.cooldowns.retain(|key, stamp| {
            let cooling = now.duration_since(*stamp) < ttl;
            if !cooling {
                info!("Proxy cooldown expired: {}", key);
            }
            cooling
        });
    }

    fn is_cooling(&self, key: &str, ttl: std::time::Duration) -> bool {
        self.cooldowns
            .get(key)
            .is_some_and(|stamp| stamp.elapsed() < ttl)
    }

    fn available_count(&mut self, ttl: std::time::Duration) -> usize {
        self.purge_expired(ttl);
        let cooldowns = &self.cooldowns;
        self.entries
            .iter()
            .filter(|p| !cooldowns.contains_key(&p.key()))
            .count()
    }
}

/// A rotating pool of proxies shared by all dispatcher calls in a process.
///
/// Invariants:
/// - `entries` never contains a blacklisted key;
/// - removal from `entries` and addition to `blacklist` happen in the same
///   call, and both lists are persisted before the call returns.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    /// Per-proxy request throttles, created lazily; keyed by proxy key so
    /// `Proxy` itself stays a plain value type.
    limiters: Mutex<HashMap<String, Arc<DirectLimiter>>>,
    store: Option<PoolStore>,
    config: PoolConfig,
}

impl ProxyPool {
    /// Build a pool over the given proxies without any backing store.
    pub fn in_memory(config: PoolConfig, proxies: Vec<Proxy>) -> Self {
        Self::build(config, proxies, HashSet::new(), None)
    }

    fn build(
        config: PoolConfig,
        proxies: Vec<Proxy>,
        blacklist: HashSet<String>,
        store: Option<PoolStore>,
    ) -> Self {
        let entries: Vec<Proxy> = proxies
            .into_iter()
            .filter(|p| !blacklist.contains(&p.key()))
            .collect();
        Self {
            state: Mutex::new(PoolState {
                entries,
                cursor: 0,
                blacklist,
                cooldowns: HashMap::new(),
            }),
            limiters: Mutex::new(HashMap::new()),
            store,
            config,
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of proxies currently in rotation.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the rotation is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Advance the rotation and return the next proxy. With `skip_cooling`,
    /// proxies in rate-limit cooldown are passed over; after one full lap the
    /// call gives up and returns `None`. An empty pool also returns `None`;
    /// both are normal triggers for direct-connection mode, never errors.
    pub fn next(&self, skip_cooling: bool) -> Option<Proxy> {
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            return None;
        }
        state.purge_expired(self.config.cooldown_ttl);

        let len = state.entries.len();
        for _ in 0..len {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % len;
            let proxy = state.entries[idx].clone();
            if skip_cooling && state.is_cooling(&proxy.key(), self.config.cooldown_ttl) {
                continue;
            }
            return Some(proxy);
        }

        warn!("All proxies are in rate-limit cooldown");
        None
    }

    /// Put a proxy into rate-limit cooldown. The proxy stays in rotation and
    /// becomes eligible again once the cooldown TTL elapses.
    pub fn mark_rate_limited(&self, proxy: &Proxy) {
        let remaining = {
            let mut state = self.state.lock();
            state.cooldowns.insert(proxy.key(), Instant::now());
            state.available_count(self.config.cooldown_ttl)
        };
        warn!(
            "Proxy {} rate-limited (429), cooling for {:?} ({} proxies still available)",
            proxy.key(),
            self.config.cooldown_ttl,
            remaining
        );
    }

    /// Permanently remove a proxy: drop it from rotation, blacklist its key,
    /// and persist both lists. Idempotent: a second call for the same proxy
    /// changes nothing.
    ///
    /// Rotation resumes from the removed slot: the proxy that logically
    /// followed the removed one is the next returned by [`next`](Self::next).
    pub fn mark_failed(&self, proxy: &Proxy) {
        let key = proxy.key();
        let (remaining, removed) = {
            let mut state = self.state.lock();
            let removed = match state.entries.iter().position(|p| p.key() == key) {
                Some(idx) => {
                    state.entries.remove(idx);
                    if idx < state.cursor {
                        state.cursor -= 1;
                    }
                    if state.cursor >= state.entries.len() {
                        state.cursor = 0;
                    }
                    true
                }
                None => false,
            };
            state.cooldowns.remove(&key);
            state.blacklist.insert(key.clone());
            self.persist(&state.entries, Some(&state.blacklist));
            (state.entries.len(), removed)
        };

        if removed {
            warn!(
                "Removed failed proxy {} from rotation ({} remaining), blacklisted",
                key, remaining
            );
        }
        self.limiters.lock().remove(&key);
    }

    /// Count proxies in rotation and not currently cooling. Purges expired
    /// cooldowns as a side effect.
    pub fn available_count(&self) -> usize {
        let mut state = self.state.lock();
        state.available_count(self.config.cooldown_ttl)
    }

    /// Whether any proxy is available for Plan A.
    pub fn has_available(&self) -> bool {
        self.available_count() > 0
    }

    /// Stats snapshot for operator tooling.
    pub fn stats(&self) -> PoolStats {
        let mut state = self.state.lock();
        state.purge_expired(self.config.cooldown_ttl);
        let total = state.entries.len();
        let cooling = state
            .entries
            .iter()
            .filter(|p| state.cooldowns.contains_key(&p.key()))
            .count();
        PoolStats {
            total,
            blacklisted: state.blacklist.len(),
            cooling,
            available: total - cooling,
        }
    }

    /// Snapshot of the blacklist, used when fetching replacement proxies.
    pub fn blacklist_snapshot(&self) -> HashSet<String> {
        self.state.lock().blacklist.clone()
    }

    /// Snapshot of the rotation, in rotation order.
    pub fn entries_snapshot(&self) -> Vec<Proxy> {
        self.state.lock().entries.clone()
    }

    /// Append fresh proxies, skipping blacklisted keys and duplicates, and
    /// persist the new rotation.
    pub fn add_proxies(&self, proxies: Vec<Proxy>) {
        let mut state = self.state.lock();
        for proxy in proxies {
            let key = proxy.key();
            if state.blacklist.contains(&key) {
                continue;
            }
            if state.entries.iter().any(|p| p.key() == key) {
                continue;
            }
            state.entries.push(proxy);
        }
        self.persist(&state.entries, None);
    }

    /// Keep only proxies whose key is in `keys`. Used by the health checker:
    /// dropped proxies are *not* blacklisted, since a failed probe may just be
    /// a temporarily overloaded proxy. Survivors are persisted.
    pub fn retain_keys(&self, keys: &HashSet<String>) {
        let mut state = self.state.lock();
        state.entries.retain(|p| keys.contains(&p.key()));
        if state.cursor >= state.entries.len() {
            state.cursor = 0;
        }
        self.persist(&state.entries, None);
    }

    /// Wait until this proxy's request throttle admits another request.
    pub async fn throttle(&self, proxy: &Proxy) {
        let limiter = {
            let mut limiters = self.limiters.lock();
            Arc::clone(limiters.entry(proxy.key()).or_insert_with(|| {
                let rps = self.config.max_requests_per_second.ceil() as u32;
                let quota = Quota::per_second(
                    NonZeroU32::new(rps.max(1)).unwrap_or(NonZeroU32::MIN),
                );
                Arc::new(RateLimiter::direct(quota))
            }))
        };
        limiter.until_ready().await;
    }

    /// Write the given lists through the store. Callers hold the state lock
    /// across the write: if two structural changes could snapshot under the
    /// lock but write after releasing it, their writes could land in the
    /// opposite order and a reload would resurrect a blacklisted proxy.
    fn persist(&self, entries: &[Proxy], blacklist: Option<&HashSet<String>>) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_proxies(entries) {
            warn!("Failed to save proxy list: {}", e);
        }
        if let Some(blacklist) = blacklist {
            if let Err(e) = store.save_blacklist(blacklist) {
                warn!("Failed to save blacklist: {}", e);
            }
        }
    }
}

/// Construct a pool from persisted state, health-check it, and top it up from
/// public sources when `auto_refresh` is set and the rotation runs short.
///
/// With `disable_proxy` the pool comes back empty and storeless; the
/// dispatcher then always uses the direct connection.
pub async fn init_pool(config: PoolConfig) -> Arc<ProxyPool> {
    if config.disable_proxy {
        info!("Proxy usage disabled, using direct connection");
        return Arc::new(ProxyPool::in_memory(config, Vec::new()));
    }

    let store = config
        .config_path
        .clone()
        .map(|path| PoolStore::new(path, config.blacklist_path.clone()));

    let (proxies, blacklist) = match &store {
        Some(store) => {
            let blacklist = store.load_blacklist();
            if !blacklist.is_empty() {
                info!("Loaded {} blacklisted proxies", blacklist.len());
            }
            (store.load_proxies(), blacklist)
        }
        None => (Vec::new(), HashSet::new()),
    };

    if proxies.is_empty() {
        warn!("No proxies available in config, starting with empty pool");
    } else {
        info!("Loaded {} proxies from config", proxies.len());
    }

    let pool = Arc::new(ProxyPool::build(config, proxies, blacklist, store));

    let checker = HealthChecker::from_config(pool.config());
    if pool.config().precheck && !pool.is_empty() {
        checker.precheck(&pool).await;
    }

    if pool.config().auto_refresh && pool.len() < pool.config().min_working {
        let needed = pool.config().min_working - pool.len();
        info!("Pool below minimum ({} short), fetching fresh proxies", needed);
        let found = sources::fetch_proxies(&pool.blacklist_snapshot(), needed, &checker).await;
        if found.is_empty() {
            warn!("No working proxies found from public sources");
        } else {
            info!("Fetched {} working proxies from public sources", found.len());
            pool.add_proxies(found);
        }
    }

    let stats = pool.stats();
    info!(
        "Proxy pool ready: {} total, {} available, {} blacklisted",
        stats.total, stats.available, stats.blacklisted
    );
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn proxy(key: &str) -> Proxy {
        Proxy::from_host_port(key).unwrap()
    }

    fn pool_with(keys: &[&str]) -> ProxyPool {
        let proxies = keys.iter().map(|k| proxy(k)).collect();
        ProxyPool::in_memory(PoolConfig::default(), proxies)
    }

    #[test]
    fn next_rotates_in_insertion_order() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80"]);
        assert_eq!(pool.next(true).unwrap().key(), "1.1.1.1:80");
        assert_eq!(pool.next(true).unwrap().key(), "2.2.2.2:80");
        assert_eq!(pool.next(true).unwrap().key(), "3.3.3.3:80");
        assert_eq!(pool.next(true).unwrap().key(), "1.1.1.1:80");
    }

    #[test]
    fn next_on_empty_pool_is_none() {
        let pool = pool_with(&[]);
        assert!(pool.next(true).is_none());
        assert!(pool.next(false).is_none());
    }

    #[test]
    fn cooling_proxy_is_skipped_before_ttl() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80"]);
        let first = pool.next(true).unwrap();
        pool.mark_rate_limited(&first);

        // One full lap never lands on the cooling proxy.
        for _ in 0..4 {
            assert_ne!(pool.next(true).unwrap().key(), first.key());
        }
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn cooling_proxy_becomes_eligible_after_ttl() {
        let config = PoolConfig::builder()
            .cooldown_ttl(Duration::from_millis(10))
            .build();
        let pool = ProxyPool::in_memory(config, vec![proxy("1.1.1.1:80"), proxy("2.2.2.2:80")]);
        pool.mark_rate_limited(&proxy("1.1.1.1:80"));
        assert_eq!(pool.available_count(), 1);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.available_count(), 2);
        let keys: Vec<String> = (0..2).map(|_| pool.next(true).unwrap().key()).collect();
        assert!(keys.contains(&"1.1.1.1:80".to_string()));
    }

    #[test]
    fn all_cooling_returns_none() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80"]);
        pool.mark_rate_limited(&proxy("1.1.1.1:80"));
        pool.mark_rate_limited(&proxy("2.2.2.2:80"));
        assert!(pool.next(true).is_none());
        assert!(!pool.has_available());
        // Without cooldown skipping the rotation still serves.
        assert!(pool.next(false).is_some());
    }

    #[test]
    fn mark_failed_removes_and_blacklists() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80"]);
        let bad = proxy("1.1.1.1:80");
        pool.mark_failed(&bad);

        assert_eq!(pool.len(), 1);
        assert!(pool.blacklist_snapshot().contains("1.1.1.1:80"));
        for _ in 0..4 {
            assert_ne!(pool.next(true).unwrap().key(), "1.1.1.1:80");
        }
    }

    #[test]
    fn mark_failed_is_idempotent() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80"]);
        let bad = proxy("1.1.1.1:80");
        pool.mark_failed(&bad);
        pool.mark_failed(&bad);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.blacklist_snapshot().len(), 1);
    }

    #[test]
    fn concurrent_failures_all_reach_the_disk_blacklist() {
        let dir = tempfile::tempdir().unwrap();
        let keys: Vec<String> = (0..8).map(|i| format!("10.0.0.{}:80", i)).collect();
        let proxies: Vec<Proxy> = keys.iter().map(|k| proxy(k)).collect();
        let store = PoolStore::new(dir.path().join("proxy_config.txt"), None);
        let pool = Arc::new(ProxyPool::build(
            PoolConfig::default(),
            proxies,
            HashSet::new(),
            Some(store.clone()),
        ));

        let handles: Vec<_> = keys
            .iter()
            .map(|key| {
                let pool = Arc::clone(&pool);
                let bad = proxy(key);
                std::thread::spawn(move || pool.mark_failed(&bad))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Whatever order the writes landed in, the last one on disk carries
        // every blacklisted key.
        let on_disk = store.load_blacklist();
        for key in &keys {
            assert!(on_disk.contains(key), "blacklist file lost {}", key);
        }
        assert!(store.load_proxies().is_empty());
    }

    #[test]
    fn removal_does_not_skip_the_next_proxy() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80"]);
        let a = pool.next(true).unwrap();
        assert_eq!(a.key(), "1.1.1.1:80");
        pool.mark_failed(&a);
        // B logically followed A and must come next.
        assert_eq!(pool.next(true).unwrap().key(), "2.2.2.2:80");
        assert_eq!(pool.next(true).unwrap().key(), "3.3.3.3:80");
        assert_eq!(pool.next(true).unwrap().key(), "2.2.2.2:80");
    }

    #[test]
    fn removing_last_entry_wraps_cursor() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80"]);
        pool.next(true);
        pool.next(true);
        let last = proxy("2.2.2.2:80");
        pool.mark_failed(&last);
        assert_eq!(pool.next(true).unwrap().key(), "1.1.1.1:80");
    }

    #[test]
    fn add_proxies_filters_blacklist_and_duplicates() {
        let pool = pool_with(&["1.1.1.1:80"]);
        pool.mark_failed(&proxy("1.1.1.1:80"));
        pool.add_proxies(vec![
            proxy("1.1.1.1:80"),
            proxy("2.2.2.2:80"),
            proxy("2.2.2.2:80"),
        ]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.next(true).unwrap().key(), "2.2.2.2:80");
    }

    #[test]
    fn retain_keys_drops_without_blacklisting() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80"]);
        let mut keep = HashSet::new();
        keep.insert("2.2.2.2:80".to_string());
        pool.retain_keys(&keep);
        assert_eq!(pool.len(), 1);
        assert!(pool.blacklist_snapshot().is_empty());
    }

    #[test]
    fn stats_reflect_cooling_and_blacklist() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80"]);
        pool.mark_rate_limited(&proxy("1.1.1.1:80"));
        pool.mark_failed(&proxy("2.2.2.2:80"));
        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.blacklisted, 1);
        assert_eq!(stats.cooling, 1);
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn init_pool_round_trips_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy_config.txt");
        std::fs::write(&path, "1.1.1.1:80\n2.2.2.2:80\n3.3.3.3:80\n").unwrap();

        let config = PoolConfig::builder()
            .config_path(&path)
            .precheck(false)
            .build();
        let pool = init_pool(config).await;
        assert_eq!(pool.len(), 3);
        pool.mark_failed(&proxy("2.2.2.2:80"));

        // A fresh pool over the same files sees the survivors minus the
        // blacklisted key.
        let config = PoolConfig::builder()
            .config_path(&path)
            .precheck(false)
            .build();
        let pool = init_pool(config).await;
        assert_eq!(pool.len(), 2);
        assert!(pool.blacklist_snapshot().contains("2.2.2.2:80"));
    }

    #[tokio::test]
    async fn init_pool_disabled_is_empty() {
        let config = PoolConfig::builder().disable_proxy(true).build();
        let pool = init_pool(config).await;
        assert!(pool.is_empty());
        assert!(pool.next(true).is_none());
    }
}
