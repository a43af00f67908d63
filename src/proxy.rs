//! Proxy representation and parsing.

use std::fmt;

use url::Url;

/// An intermediary egress address. Immutable value type; identity is the
/// canonical `host:port` key, used for all blacklist and cooldown membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    /// URL scheme, e.g. `http` or `socks5`.
    pub scheme: String,
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Proxy {
    /// Create a proxy with an explicit scheme.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Canonical `host:port` key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full `scheme://host:port` URL string.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Parse a bare `host:port` line. Scheme defaults to `http`.
    pub fn from_host_port(line: &str) -> Option<Self> {
        let line = line.trim();
        let (host, port) = line.rsplit_once(':')?;
        let port: u16 = port.trim().parse().ok()?;
        let host = host.trim();
        if host.is_empty() {
            return None;
        }
        Some(Self::new("http", host, port))
    }

    /// Parse a `scheme://host:port` URL string, falling back to `host:port`.
    pub fn from_url_str(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s.starts_with('#') {
            return None;
        }
        if s.contains("://") {
            let url = Url::parse(s).ok()?;
            let host = url.host_str()?.to_string();
            let port = url.port()?;
            return Some(Self::new(url.scheme(), host, port));
        }
        Self::from_host_port(s)
    }

    /// Convert to a `reqwest::Proxy` covering all traffic.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        reqwest::Proxy::all(self.url())
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let p = Proxy::from_host_port("10.0.0.1:8080").unwrap();
        assert_eq!(p.scheme, "http");
        assert_eq!(p.key(), "10.0.0.1:8080");
        assert_eq!(p.url(), "http://10.0.0.1:8080");
    }

    #[test]
    fn parses_url_form() {
        let p = Proxy::from_url_str("socks5://1.2.3.4:1080").unwrap();
        assert_eq!(p.scheme, "socks5");
        assert_eq!(p.key(), "1.2.3.4:1080");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Proxy::from_host_port("no-port-here").is_none());
        assert!(Proxy::from_host_port(":8080").is_none());
        assert!(Proxy::from_host_port("1.2.3.4:notaport").is_none());
        assert!(Proxy::from_url_str("# comment").is_none());
        assert!(Proxy::from_url_str("").is_none());
    }

    #[test]
    fn key_is_identity() {
        let a = Proxy::from_host_port("1.2.3.4:80").unwrap();
        let b = Proxy::from_url_str("http://1.2.3.4:80").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
    }
}
