//! TTL response cache + HTTP fetch utilities shared by source adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "scout-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache ttl must be greater than zero")]
    ZeroTtl,
    #[error("cache ttl {0:?} overflows the expiry timestamp")]
    TtlOutOfRange(Duration),
}

/// Raw payload cache keyed by request identity.
///
/// Entries past their expiry are invisible to readers; they are only physically
/// removed by [`ResponseCache::sweep`]. There is no size bound.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Utc::now()).await
    }

    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.is_live_at(now))
            .map(|entry| entry.value.clone())
    }

    /// Insert or replace `key`; last writer wins.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.set_at(key, value, ttl, Utc::now()).await
    }

    pub async fn set_at(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::ZeroTtl);
        }
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or(CacheError::TtlOutOfRange(ttl))?;
        let entry = CacheEntry {
            value: value.into(),
            created_at: now,
            expires_at,
        };
        self.entries.write().await.insert(key.into(), entry);
        Ok(())
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live_at(now));
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, remaining = entries.len(), "swept expired cache entries");
        }
        removed
    }

    /// Physical entry count, expired entries included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Throttling and server-side failures are worth another attempt; other statuses are final.
pub fn status_is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Only connect failures are retried. A timeout is final so a slow source
/// becomes a recorded failure instead of a retry loop.
pub fn error_is_retryable(err: &reqwest::Error) -> bool {
    err.is_connect() && !err.is_timeout()
}

/// Capped exponential pause between attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub first_pause: Duration,
    pub pause_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            first_pause: Duration::from_millis(500),
            pause_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// `first_pause * 2^retry`, never above `pause_cap`.
    pub fn pause_before(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|exp| 2u32.checked_pow(exp))
            .unwrap_or(u32::MAX);
        self.first_pause.saturating_mul(factor).min(self.pause_cap)
    }

    pub fn allows(&self, retries_done: usize) -> bool {
        retries_done < self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub retry: RetryPolicy,
    pub pacing: Option<PacingConfig>,
    pub cache_ttl: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 3,
            per_source_concurrency: 1,
            retry: RetryPolicy::default(),
            pacing: None,
            cache_ttl: Duration::from_secs(6 * 3600),
        }
    }
}

/// Token bucket shape: up to `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub burst: u32,
    pub interval: Duration,
}

impl PacingConfig {
    /// One request per `delay`, the politeness pause between provider hits.
    /// A zero delay disables pacing.
    pub fn fixed_delay(delay: Duration) -> Option<Self> {
        (!delay.is_zero()).then_some(Self {
            burst: 1,
            interval: delay,
        })
    }
}

/// Shared across every outbound request of one fetcher.
#[derive(Debug)]
pub struct RequestPacer {
    config: PacingConfig,
    state: Mutex<PacerState>,
}

#[derive(Debug)]
struct PacerState {
    tokens: u32,
    refilled_at: Instant,
}

impl RequestPacer {
    pub fn new(config: PacingConfig) -> Self {
        let config = PacingConfig {
            burst: config.burst.max(1),
            interval: config.interval,
        };
        Self {
            config,
            state: Mutex::new(PacerState {
                tokens: config.burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits for a free slot and consumes it.
    pub async fn take(&self) {
        loop {
            let ready_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.refilled_at);
                if !self.config.interval.is_zero() && elapsed >= self.config.interval {
                    let earned = elapsed.as_nanos() / self.config.interval.as_nanos();
                    let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                    state.tokens = state.tokens.saturating_add(earned).min(self.config.burst);
                    state.refilled_at = now;
                }
                if state.tokens > 0 || self.config.interval.is_zero() {
                    state.tokens = state.tokens.saturating_sub(1);
                    return;
                }
                state.refilled_at + self.config.interval
            };
            tokio::time::sleep_until(ready_at).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// Shared HTTP client; consults the response cache before touching the network.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cache: Arc<ResponseCache>,
    cache_ttl: Duration,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, cache: Arc<ResponseCache>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            cache,
            cache_ttl: config.cache_ttl,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            pacer: config.pacing.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url` as text, served from the cache while fresh.
    pub async fn fetch_text(
        &self,
        source_id: &str,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<String, FetchError> {
        if let Some(cached) = self.cache.get(url).await {
            debug!(source_id, url, "using cached response");
            return Ok(cached);
        }

        let body = self
            .fetch_uncached(source_id, url, bearer_token)
            .instrument(info_span!("http_fetch", source_id, url))
            .await?;
        let text = String::from_utf8_lossy(&body).into_owned();

        if let Err(err) = self.cache.set(url, text.clone(), self.cache_ttl).await {
            warn!(source_id, url, error = %err, "response not cached");
        }
        info!(source_id, url, bytes = body.len(), "fetched");
        Ok(text)
    }

    async fn fetch_uncached(
        &self,
        source_id: &str,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let mut retries = 0;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.take().await;
            }

            let mut request = self.client.get(url);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !status_is_retryable(status) || !self.retry.allows(retries) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    debug!(source_id, url, retries, status = status.as_u16(), "retrying request");
                }
                Err(err) => {
                    if !error_is_retryable(&err) || !self.retry.allows(retries) {
                        return Err(FetchError::Request(err));
                    }
                    debug!(source_id, url, retries, error = %err, "retrying request");
                }
            }

            tokio::time::sleep(self.retry.pause_before(retries)).await;
            retries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn ts(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn cache_serves_value_within_ttl_and_hides_it_after_expiry() {
        let cache = ResponseCache::new();
        let now = ts("2026-03-01T12:00:00Z");
        cache
            .set_at("fbref:/mls", "<html/>", Duration::from_secs(60), now)
            .await
            .unwrap();

        assert_eq!(
            cache.get_at("fbref:/mls", now).await.as_deref(),
            Some("<html/>")
        );
        assert_eq!(
            cache
                .get_at("fbref:/mls", ts("2026-03-01T12:00:59Z"))
                .await
                .as_deref(),
            Some("<html/>")
        );
        assert!(cache
            .get_at("fbref:/mls", ts("2026-03-01T12:01:00Z"))
            .await
            .is_none());
        assert!(cache
            .get_at("fbref:/mls", ts("2026-03-01T12:05:00Z"))
            .await
            .is_none());
        assert_eq!(cache.len().await, 1, "expired entries linger until swept");
    }

    #[tokio::test]
    async fn later_set_replaces_value_and_expiry() {
        let cache = ResponseCache::new();
        let now = ts("2026-03-01T12:00:00Z");
        cache
            .set_at("k", "first", Duration::from_secs(10), now)
            .await
            .unwrap();
        cache
            .set_at("k", "second", Duration::from_secs(3600), now)
            .await
            .unwrap();

        let later = ts("2026-03-01T12:30:00Z");
        assert_eq!(cache.get_at("k", later).await.as_deref(), Some("second"));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let cache = ResponseCache::new();
        let err = cache.set("k", "v", Duration::ZERO).await.unwrap_err();
        assert_eq!(err, CacheError::ZeroTtl);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let cache = ResponseCache::new();
        let now = ts("2026-03-01T12:00:00Z");
        cache
            .set_at("short", "a", Duration::from_secs(5), now)
            .await
            .unwrap();
        cache
            .set_at("long", "b", Duration::from_secs(500), now)
            .await
            .unwrap();
        cache
            .set_at("medium", "c", Duration::from_secs(50), now)
            .await
            .unwrap();

        let removed = cache.sweep_at(ts("2026-03-01T12:01:00Z")).await;
        assert_eq!(removed, 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(
            cache
                .get_at("long", ts("2026-03-01T12:01:00Z"))
                .await
                .as_deref(),
            Some("b")
        );
        assert_eq!(cache.sweep_at(ts("2026-03-01T12:01:00Z")).await, 0);
    }

    #[tokio::test]
    async fn concurrent_writers_leave_one_entry_per_key() {
        let cache = Arc::new(ResponseCache::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .set("shared", format!("v{i}"), Duration::from_secs(60))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.len().await, 1);
        let value = cache.get("shared").await.unwrap();
        assert!(value.starts_with('v'));
    }

    #[test]
    fn retry_pause_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            first_pause: Duration::from_millis(100),
            pause_cap: Duration::from_millis(350),
        };

        assert_eq!(policy.pause_before(0), Duration::from_millis(100));
        assert_eq!(policy.pause_before(1), Duration::from_millis(200));
        assert_eq!(policy.pause_before(2), Duration::from_millis(350));
        assert_eq!(policy.pause_before(40), Duration::from_millis(350));
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(status_is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(status_is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!status_is_retryable(StatusCode::NOT_FOUND));
        assert!(!status_is_retryable(StatusCode::FORBIDDEN));
    }

    #[test]
    fn fixed_delay_pacing_is_disabled_for_zero_delay() {
        assert!(PacingConfig::fixed_delay(Duration::ZERO).is_none());
        let pacing = PacingConfig::fixed_delay(Duration::from_secs(2)).unwrap();
        assert_eq!(pacing.burst, 1);
        assert_eq!(pacing.interval, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_requests_one_interval_apart() {
        let pacer = RequestPacer::new(PacingConfig::fixed_delay(Duration::from_secs(2)).unwrap());
        let started = tokio::time::Instant::now();

        pacer.take().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        pacer.take().await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        pacer.take().await;
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_allows_a_burst_then_waits() {
        let pacer = RequestPacer::new(PacingConfig {
            burst: 2,
            interval: Duration::from_secs(1),
        });
        let started = tokio::time::Instant::now();

        pacer.take().await;
        pacer.take().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        pacer.take().await;
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    async fn serve_fixed_body(body: &'static str, hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/players")
    }

    #[tokio::test]
    async fn second_fetch_within_ttl_is_served_from_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = serve_fixed_body("<table></table>", hits.clone()).await;
        let cache = Arc::new(ResponseCache::new());
        let fetcher = HttpFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
            cache.clone(),
        )
        .unwrap();

        let first = fetcher.fetch_text("fbref", &url, None).await.unwrap();
        let second = fetcher.fetch_text("fbref", &url, None).await.unwrap();

        assert_eq!(first, "<table></table>");
        assert_eq!(second, first);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&url).await.as_deref(), Some("<table></table>"));
    }
}
