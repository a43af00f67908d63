//! Request dispatching with proxy rotation and direct-connection fallback.
//!
//! Two plans per call. Plan A rotates through the proxy pool and retries
//! immediately on 429: a fresh proxy presents a fresh IP, so waiting is
//! wasted time. Plan B is the direct connection and has no identity to
//! rotate, so it slows down with exponential backoff and jitter instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{FetchError, TransportError};
use crate::health::USER_AGENT;
use crate::pool::ProxyPool;
use crate::proxy::Proxy;

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Response {
    /// Assemble a response from parts.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// HTTP status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, lossy on invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Per-request options forwarded by scraping collaborators.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Request timeout; falls back to the pool's `request_timeout`.
    pub timeout: Option<Duration>,
    /// Extra headers.
    pub headers: HeaderMap,
    /// Request body, if any.
    pub body: Option<Vec<u8>>,
}

/// The transport seam: one HTTP exchange, optionally through a proxy, with
/// the error already classified. Swappable in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        url: &str,
        proxy: Option<&Proxy>,
        options: &RequestOptions,
    ) -> Result<Response, TransportError>;
}

/// Default transport backed by reqwest. A client is built per request so the
/// proxy can differ between attempts.
pub struct ReqwestTransport {
    default_timeout: Duration,
}

impl ReqwestTransport {
    /// Create a transport with the given default timeout.
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        method: Method,
        url: &str,
        proxy: Option<&Proxy>,
        options: &RequestOptions,
    ) -> Result<Response, TransportError> {
        let mut builder = reqwest::Client::builder()
            .timeout(options.timeout.unwrap_or(self.default_timeout))
            .user_agent(USER_AGENT);
        if let Some(proxy) = proxy {
            let reqwest_proxy = proxy
                .to_reqwest_proxy()
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            builder = builder.proxy(reqwest_proxy);
        }
        let client = builder.build().map_err(classify_reqwest_error)?;

        let mut request = client.request(method, url).headers(options.headers.clone());
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(classify_reqwest_error)?
            .to_vec();
        Ok(Response::new(status, headers, body))
    }
}

/// Sort a reqwest error into the transport taxonomy. Proxy and tunnel
/// failures show up as connect errors (or mention the proxy in the message)
/// and are blamed on the proxy in use.
fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        return TransportError::Timeout;
    }
    // reqwest's Display often hides the cause; walk the source chain so
    // proxy/tunnel failures are recognizable.
    let mut text = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    let lowered = text.to_lowercase();
    if e.is_connect() || lowered.contains("proxy") || lowered.contains("tunnel") {
        TransportError::Connect(text)
    } else {
        TransportError::Other(text)
    }
}

/// What one attempt amounted to. Keeps payload and error kind in separate
/// arms instead of sentinel values.
enum RequestOutcome {
    Success(Response),
    RateLimited,
    ConnectionFailure(TransportError),
    Blocked(StatusCode),
    OtherFailure(FetchError),
}

fn classify(result: Result<Response, TransportError>) -> RequestOutcome {
    match result {
        Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => RequestOutcome::RateLimited,
        Ok(resp) if resp.status() == StatusCode::FORBIDDEN => {
            RequestOutcome::Blocked(resp.status())
        }
        Ok(resp) if resp.status().is_success() => RequestOutcome::Success(resp),
        Ok(resp) => RequestOutcome::OtherFailure(FetchError::Status {
            status: resp.status(),
        }),
        Err(e) if e.is_connection() => RequestOutcome::ConnectionFailure(e),
        Err(e) => RequestOutcome::OtherFailure(FetchError::Transport(e)),
    }
}

/// Dispatches single requests against a shared proxy pool.
pub struct Dispatcher {
    pool: Arc<ProxyPool>,
    transport: Arc<dyn Transport>,
    identity_probed: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher over the given pool using the reqwest transport.
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        let timeout = pool.config().request_timeout;
        Self::with_transport(pool, Arc::new(ReqwestTransport::new(timeout)))
    }

    /// Create a dispatcher with a custom transport.
    pub fn with_transport(pool: Arc<ProxyPool>, transport: Arc<dyn Transport>) -> Self {
        Self {
            pool,
            transport,
            identity_probed: AtomicBool::new(false),
        }
    }

    /// The pool this dispatcher rotates through.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Make one HTTP request, rotating proxies while any are available and
    /// falling back to a direct connection with backoff otherwise.
    ///
    /// Returns the response on any 2xx, `FetchError::RateLimited` when the
    /// direct-mode retry budget is exhausted on 429s, `FetchError::Blocked`
    /// on 403, and otherwise the last error seen.
    pub async fn dispatch(
        &self,
        method: Method,
        url: &str,
        max_retries: usize,
        use_proxy: bool,
        options: &RequestOptions,
    ) -> Result<Response, FetchError> {
        let mut last_error: Option<FetchError> = None;

        if use_proxy && self.pool.has_available() {
            match self.plan_a(&method, url, options).await? {
                PlanAResult::Done(response) => return Ok(response),
                PlanAResult::FallThrough(err) => last_error = err,
            }
        }

        if use_proxy {
            info!("Using direct connection");
        }
        self.plan_b(&method, url, max_retries, options, last_error)
            .await
    }

    /// Plan A: rotate through the pool. Budget of two laps so a pool of
    /// transiently rate-limited proxies gets a second look before giving up.
    async fn plan_a(
        &self,
        method: &Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<PlanAResult, FetchError> {
        let budget = self.pool.len() * 2;
        let mut last_error: Option<FetchError> = None;

        for _ in 0..budget {
            let Some(proxy) = self.pool.next(true) else {
                warn!("No available proxies, falling back to direct connection");
                break;
            };
            self.pool.throttle(&proxy).await;
            debug!("Trying proxy {}", proxy.key());

            let result = self
                .transport
                .send(method.clone(), url, Some(&proxy), options)
                .await;
            match classify(result) {
                RequestOutcome::Success(response) => {
                    self.note_success();
                    return Ok(PlanAResult::Done(response));
                }
                RequestOutcome::RateLimited => {
                    self.pool.mark_rate_limited(&proxy);
                    if self.pool.has_available() {
                        info!("Rotating to next proxy");
                        continue;
                    }
                    warn!("All proxies rate-limited, falling back to direct connection");
                    break;
                }
                RequestOutcome::ConnectionFailure(e) => {
                    self.pool.mark_failed(&proxy);
                    last_error = Some(FetchError::Transport(e));
                    if self.pool.is_empty() {
                        warn!("All proxies failed, falling back to direct connection");
                        break;
                    }
                    continue;
                }
                RequestOutcome::Blocked(status) => {
                    // Blocked outright; rotating will not help and the caller
                    // needs to know.
                    return Err(FetchError::Blocked { status });
                }
                RequestOutcome::OtherFailure(e) => {
                    // Not the proxy's fault; do not blame it.
                    last_error = Some(e);
                    break;
                }
            }
        }

        Ok(PlanAResult::FallThrough(last_error))
    }

    /// Plan B: direct connection with exponential backoff on 429 and linear
    /// backoff on other failures.
    async fn plan_b(
        &self,
        method: &Method,
        url: &str,
        max_retries: usize,
        options: &RequestOptions,
        mut last_error: Option<FetchError>,
    ) -> Result<Response, FetchError> {
        for attempt in 0..max_retries {
            let result = self.transport.send(method.clone(), url, None, options).await;
            match classify(result) {
                RequestOutcome::Success(response) => {
                    self.note_success();
                    return Ok(response);
                }
                RequestOutcome::RateLimited => {
                    if attempt + 1 >= max_retries {
                        return Err(FetchError::RateLimited {
                            attempts: max_retries,
                        });
                    }
                    let base = 1u64 << (attempt + 1);
                    let jitter: f64 = rand::rng().random_range(0.0..1.0);
                    let wait = Duration::from_secs_f64(base as f64 + jitter);
                    warn!(
                        "Rate limited (429), waiting {:.1}s (attempt {}/{})",
                        wait.as_secs_f64(),
                        attempt + 1,
                        max_retries
                    );
                    tokio::time::sleep(wait).await;
                }
                RequestOutcome::Blocked(status) => {
                    return Err(FetchError::Blocked { status });
                }
                RequestOutcome::ConnectionFailure(e) => {
                    self.plan_b_backoff(attempt, max_retries, FetchError::Transport(e), &mut last_error)
                        .await?;
                }
                RequestOutcome::OtherFailure(e) => {
                    self.plan_b_backoff(attempt, max_retries, e, &mut last_error)
                        .await?;
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::RateLimited {
            attempts: max_retries,
        }))
    }

    /// Linear backoff between direct-mode retries; surfaces the last error
    /// once the budget is spent.
    async fn plan_b_backoff(
        &self,
        attempt: usize,
        max_retries: usize,
        err: FetchError,
        last_error: &mut Option<FetchError>,
    ) -> Result<(), FetchError> {
        if attempt + 1 >= max_retries {
            return Err(err);
        }
        *last_error = Some(err);
        let wait = Duration::from_secs(2 * (attempt as u64 + 1));
        warn!("Request failed, retrying in {}s", wait.as_secs());
        tokio::time::sleep(wait).await;
        Ok(())
    }

    /// On the first success of this dispatcher's lifetime, probe the current
    /// egress identity out of band. Purely operator visibility; a probe
    /// failure never affects the dispatch result.
    fn note_success(&self) {
        if self.identity_probed.swap(true, Ordering::Relaxed) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            log_egress_identity(transport).await;
        });
    }
}

enum PlanAResult {
    Done(Response),
    FallThrough(Option<FetchError>),
}

/// Look up the current public IP and country, trying ipapi.co first and
/// ip-api.com as a fallback, and log the result.
async fn log_egress_identity(transport: Arc<dyn Transport>) {
    const PROBES: &[&str] = &["https://ipapi.co/json/", "http://ip-api.com/json/"];
    let options = RequestOptions {
        timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    };

    for probe in PROBES {
        let Ok(response) = transport.send(Method::GET, probe, None, &options).await else {
            continue;
        };
        if !response.status().is_success() {
            continue;
        }
        let Ok(value) = response.json::<serde_json::Value>() else {
            continue;
        };
        let ip = value
            .get("ip")
            .or_else(|| value.get("query"))
            .and_then(|v| v.as_str());
        let country = value
            .get("country_name")
            .or_else(|| value.get("country"))
            .and_then(|v| v.as_str());
        if let Some(ip) = ip {
            match country {
                Some(country) => info!("Egress IP: {} ({})", ip, country),
                None => info!("Egress IP: {}", ip),
            }
            return;
        }
    }
    debug!("Could not determine egress IP");
}

/// Recommended pacing between consecutive scrape requests: shorter when
/// proxies can absorb rate limiting, longer for a bare direct connection.
pub fn recommended_delay(pool: &ProxyPool) -> Duration {
    let mut rng = rand::rng();
    if pool.has_available() {
        Duration::from_secs_f64(rng.random_range(3.0..5.0))
    } else {
        Duration::from_secs_f64(rng.random_range(5.0..10.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Transport that replays a script for the URL under test and records
    /// which proxy each attempt went through. Unscripted URLs (the identity
    /// probes) just fail quietly.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Response, TransportError>>>,
        seen_proxies: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Result<Response, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                seen_proxies: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Option<String>> {
            self.seen_proxies.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _method: Method,
            url: &str,
            proxy: Option<&Proxy>,
            _options: &RequestOptions,
        ) -> Result<Response, TransportError> {
            if url != TEST_URL {
                return Err(TransportError::Other("unscripted url".into()));
            }
            self.seen_proxies.lock().push(proxy.map(|p| p.key()));
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into())))
        }
    }

    const TEST_URL: &str = "https://example.com/data";

    fn status(code: u16) -> Result<Response, TransportError> {
        Ok(Response::new(
            StatusCode::from_u16(code).unwrap(),
            HeaderMap::new(),
            b"{}".to_vec(),
        ))
    }

    fn pool_with(keys: &[&str]) -> Arc<ProxyPool> {
        let proxies = keys
            .iter()
            .map(|k| Proxy::from_host_port(k).unwrap())
            .collect();
        Arc::new(ProxyPool::in_memory(PoolConfig::default(), proxies))
    }

    fn dispatcher(
        pool: &Arc<ProxyPool>,
        transport: &Arc<ScriptedTransport>,
    ) -> Dispatcher {
        Dispatcher::with_transport(Arc::clone(pool), Arc::clone(transport) as Arc<dyn Transport>)
    }

    #[tokio::test]
    async fn rotates_past_rate_limited_proxies() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80"]);
        let transport = ScriptedTransport::new(vec![status(429), status(429), status(200)]);
        let d = dispatcher(&pool, &transport);

        let response = d
            .dispatch(Method::GET, TEST_URL, 3, true, &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            transport.seen(),
            vec![
                Some("1.1.1.1:80".to_string()),
                Some("2.2.2.2:80".to_string()),
                Some("3.3.3.3:80".to_string()),
            ]
        );
        // A and B are cooling, C is still available.
        assert_eq!(pool.available_count(), 1);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn connect_failure_blacklists_the_proxy() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80"]);
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connect("tunnel failed".into())),
            status(200),
        ]);
        let d = dispatcher(&pool, &transport);

        let response = d
            .dispatch(Method::GET, TEST_URL, 3, true, &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pool.len(), 1);
        assert!(pool.blacklist_snapshot().contains("1.1.1.1:80"));
        assert!(pool.next(true).is_some_and(|p| p.key() != "1.1.1.1:80"));
    }

    #[tokio::test]
    async fn other_http_error_falls_through_without_blaming_proxy() {
        let pool = pool_with(&["1.1.1.1:80"]);
        let transport = ScriptedTransport::new(vec![status(500), status(200)]);
        let d = dispatcher(&pool, &transport);

        let response = d
            .dispatch(Method::GET, TEST_URL, 3, true, &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        // Second attempt was direct; the proxy is neither cooling nor gone.
        assert_eq!(transport.seen()[1], None);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.available_count(), 1);
    }

    #[tokio::test]
    async fn blocked_status_surfaces_immediately() {
        let pool = pool_with(&["1.1.1.1:80"]);
        let transport = ScriptedTransport::new(vec![status(403)]);
        let d = dispatcher(&pool, &transport);

        let err = d
            .dispatch(Method::GET, TEST_URL, 5, true, &RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Blocked { status } if status == StatusCode::FORBIDDEN));
        assert_eq!(transport.seen().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_mode_backs_off_exponentially_on_429() {
        let pool = pool_with(&[]);
        let transport = ScriptedTransport::new(vec![status(429), status(429), status(200)]);
        let d = dispatcher(&pool, &transport);

        let start = tokio::time::Instant::now();
        let response = d
            .dispatch(Method::GET, TEST_URL, 3, true, &RequestOptions::default())
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(response.status(), StatusCode::OK);
        // (2 + jitter) + (4 + jitter), jitter in [0, 1).
        assert!(elapsed >= Duration::from_secs(6), "slept {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(8), "slept {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_mode_exhaustion_is_rate_limit_error() {
        let pool = pool_with(&[]);
        let transport = ScriptedTransport::new(vec![status(429), status(429)]);
        let d = dispatcher(&pool, &transport);

        let err = d
            .dispatch(Method::GET, TEST_URL, 2, false, &RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::RateLimited { attempts: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn direct_mode_retries_other_errors_linearly() {
        let pool = pool_with(&[]);
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Other("io error".into())),
            Err(TransportError::Other("io error".into())),
        ]);
        let d = dispatcher(&pool, &transport);

        let start = tokio::time::Instant::now();
        let err = d
            .dispatch(Method::GET, TEST_URL, 2, false, &RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Transport(TransportError::Other(_))));
        // One retry gap of 2 * (0 + 1) seconds.
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn use_proxy_false_goes_straight_to_direct() {
        let pool = pool_with(&["1.1.1.1:80"]);
        let transport = ScriptedTransport::new(vec![status(200)]);
        let d = dispatcher(&pool, &transport);

        let response = d
            .dispatch(Method::GET, TEST_URL, 3, false, &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.seen(), vec![None]);
    }

    #[tokio::test]
    async fn empty_pool_is_direct_mode_not_an_error() {
        let pool = pool_with(&[]);
        let transport = ScriptedTransport::new(vec![status(200)]);
        let d = dispatcher(&pool, &transport);

        let response = d
            .dispatch(Method::GET, TEST_URL, 3, true, &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn all_proxies_dead_falls_back_to_direct() {
        let pool = pool_with(&["1.1.1.1:80", "2.2.2.2:80"]);
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connect("refused".into())),
            Err(TransportError::Connect("refused".into())),
            status(200),
        ]);
        let d = dispatcher(&pool, &transport);

        let response = d
            .dispatch(Method::GET, TEST_URL, 3, true, &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(pool.is_empty());
        assert_eq!(pool.blacklist_snapshot().len(), 2);
        assert_eq!(transport.seen()[2], None);
    }

    #[test]
    fn response_json_deserializes_body() {
        let response = Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            br#"{"ip": "1.2.3.4"}"#.to_vec(),
        );
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["ip"], "1.2.3.4");
        assert!(response.text().contains("1.2.3.4"));
    }
}
