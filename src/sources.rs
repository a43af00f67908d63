//! Fetching candidate proxies from public proxy-list providers.
//!
//! A "stop at good enough" waterfall: providers are tried in priority order
//! and the search ends as soon as enough working proxies are collected, so a
//! depleted pool does not stall startup behind an exhaustive sweep.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{info, warn};

use crate::health::{HealthChecker, USER_AGENT};
use crate::proxy::Proxy;
use crate::store::parse_proxy_lines;

/// At most this many candidates are taken from any single provider; free
/// lists run to thousands of mostly-dead entries.
const MAX_CANDIDATES_PER_PROVIDER: usize = 20;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A public proxy-list provider.
struct Provider {
    name: &'static str,
    url: &'static str,
}

/// Priority order: the ProxyScrape API tends to carry fresher entries.
const PROVIDERS: &[Provider] = &[
    Provider {
        name: "proxyscrape",
        url: "https://api.proxyscrape.com/v2/?request=get&protocol=http&timeout=10000&country=all&ssl=all&anonymity=all",
    },
    Provider {
        name: "thespeedx",
        url: "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
    },
];

/// Seam between the waterfall and the network: listing one provider and
/// probing one candidate.
#[async_trait]
trait ProviderSource: Send + Sync {
    async fn list(&self, provider: &Provider) -> Result<Vec<Proxy>>;
    async fn probe(&self, proxy: &Proxy) -> bool;
}

struct LiveSource<'a> {
    checker: &'a HealthChecker,
}

#[async_trait]
impl ProviderSource for LiveSource<'_> {
    async fn list(&self, provider: &Provider) -> Result<Vec<Proxy>> {
        fetch_provider(provider).await
    }

    async fn probe(&self, proxy: &Proxy) -> bool {
        self.checker.check(proxy).await
    }
}

/// Fetch candidate proxies until `min_needed` working ones are found.
///
/// Per provider: fetch the raw list, drop blacklisted keys, then health-check
/// candidates one at a time; the provider loop short-circuits the moment the
/// quota is met. If every provider is exhausted first, whatever was found is
/// returned, possibly nothing.
pub async fn fetch_proxies(
    blacklist: &HashSet<String>,
    min_needed: usize,
    checker: &HealthChecker,
) -> Vec<Proxy> {
    run_waterfall(PROVIDERS, blacklist, min_needed, &LiveSource { checker }).await
}

async fn run_waterfall(
    providers: &[Provider],
    blacklist: &HashSet<String>,
    min_needed: usize,
    source: &dyn ProviderSource,
) -> Vec<Proxy> {
    let mut working = Vec::new();
    if min_needed == 0 {
        return working;
    }

    for provider in providers {
        let candidates = match source.list(provider).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Provider {} failed: {:#}", provider.name, e);
                continue;
            }
        };
        info!(
            "Provider {}: {} candidates, testing...",
            provider.name,
            candidates.len()
        );

        for candidate in candidates {
            if blacklist.contains(&candidate.key()) {
                continue;
            }
            if working.iter().any(|p: &Proxy| p.key() == candidate.key()) {
                continue;
            }
            if source.probe(&candidate).await {
                info!("Proxy {} is working", candidate.key());
                working.push(candidate);
                if working.len() >= min_needed {
                    return working;
                }
            }
        }
    }

    working
}

async fn fetch_provider(provider: &Provider) -> Result<Vec<Proxy>> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build client")?;
    let response = client
        .get(provider.url)
        .send()
        .await
        .with_context(|| format!("request to {} failed", provider.name))?;
    if !response.status().is_success() {
        bail!("{} returned status {}", provider.name, response.status());
    }
    let body = response.text().await.context("failed to read body")?;
    Ok(parse_provider_body(&body))
}

/// Both current providers serve plain `host:port` lines.
fn parse_provider_body(body: &str) -> Vec<Proxy> {
    let mut proxies = parse_proxy_lines(body);
    proxies.truncate(MAX_CANDIDATES_PER_PROVIDER);
    proxies
}
