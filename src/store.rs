//! Persisted pool state: proxy list and blacklist files.
//!
//! Loads are permissive: a missing file is an empty set, a malformed file is
//! logged and treated as empty. Callers never crash on bad state. Writes go
//! through a temp file and rename so a crash mid-write cannot leave a
//! half-written list behind.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::proxy::Proxy;

/// Structured proxy config document: `{"proxies": [{"http": "...", "https": "..."}]}`.
#[derive(Debug, Serialize, Deserialize)]
struct ProxyDocument {
    #[serde(default)]
    proxies: Vec<ProxyUrls>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProxyUrls {
    #[serde(default)]
    http: Option<String>,
    #[serde(default)]
    https: Option<String>,
}

/// File-backed storage for a pool's proxy list and blacklist.
#[derive(Debug, Clone)]
pub struct PoolStore {
    proxy_path: PathBuf,
    blacklist_path: PathBuf,
}

impl PoolStore {
    /// Create a store over the given proxy list path. The blacklist path
    /// defaults to `proxy_blacklist.txt` next to the proxy list.
    pub fn new(proxy_path: impl Into<PathBuf>, blacklist_path: Option<PathBuf>) -> Self {
        let proxy_path = proxy_path.into();
        let blacklist_path = blacklist_path.unwrap_or_else(|| {
            proxy_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("proxy_blacklist.txt")
        });
        Self {
            proxy_path,
            blacklist_path,
        }
    }

    /// Load the proxy list. Accepts line-oriented `host:port` entries with
    /// `#` comments, or a JSON document with a `proxies` array.
    pub fn load_proxies(&self) -> Vec<Proxy> {
        let content = match fs::read_to_string(&self.proxy_path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed to read {}: {}", self.proxy_path.display(), e);
                return Vec::new();
            }
        };

        if content.trim_start().starts_with('{') {
            return self.parse_json_proxies(&content);
        }
        let proxies = parse_proxy_lines(&content);
        let has_entries = content
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && !line.starts_with('#'));
        if proxies.is_empty() && has_entries {
            warn!(
                "Malformed proxy config {}: no parseable entries (treating as empty)",
                self.proxy_path.display()
            );
        }
        proxies
    }

    fn parse_json_proxies(&self, content: &str) -> Vec<Proxy> {
        let doc: ProxyDocument = match serde_json::from_str(content) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    "Malformed proxy config {}: {} (treating as empty)",
                    self.proxy_path.display(),
                    e
                );
                return Vec::new();
            }
        };
        doc.proxies
            .iter()
            .filter_map(|urls| {
                let url = urls.http.as_deref().or(urls.https.as_deref())?;
                Proxy::from_url_str(url)
            })
            .collect()
    }

    /// Load the blacklist of `host:port` keys.
    pub fn load_blacklist(&self) -> HashSet<String> {
        let content = match fs::read_to_string(&self.blacklist_path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return HashSet::new(),
            Err(e) => {
                warn!("Failed to read {}: {}", self.blacklist_path.display(), e);
                return HashSet::new();
            }
        };
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    /// Persist the proxy list in line format.
    pub fn save_proxies(&self, proxies: &[Proxy]) -> io::Result<()> {
        let mut out = String::from("# Proxy configuration file\n# Format: one proxy per line as IP:PORT\n\n");
        for proxy in proxies {
            out.push_str(&proxy.key());
            out.push('\n');
        }
        write_atomic(&self.proxy_path, &out)
    }

    /// Persist the blacklist, one key per line, sorted for stable diffs.
    pub fn save_blacklist(&self, blacklist: &HashSet<String>) -> io::Result<()> {
        let mut keys: Vec<&String> = blacklist.iter().collect();
        keys.sort();
        let mut out = String::from("# Blacklisted proxies (one per line)\n");
        for key in keys {
            out.push_str(key);
            out.push('\n');
        }
        write_atomic(&self.blacklist_path, &out)
    }
}

/// Parse line-oriented `host:port` content, skipping comments and blanks.
pub(crate) fn parse_proxy_lines(content: &str) -> Vec<Proxy> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(Proxy::from_url_str)
        .collect()
}

/// Write via temp file + rename so the target is never half-written.
fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}
