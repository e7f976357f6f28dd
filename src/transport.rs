//! HTTP GET with bounded exponential-backoff retry.
//!
//! [`Fetch`] is a single attempt against the network; [`Transport`] wraps any
//! `Fetch` with the retry policy. Each call to [`Transport::get`] starts with a
//! fresh attempt budget; nothing is remembered between calls.
use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("invalid response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

/// A successful response body and the `Content-Type` it was served with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fetched {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl Fetched {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// The `charset` parameter of the content type, if any.
    pub fn charset(&self) -> Option<&str> {
        self.content_type
            .as_deref()?
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
            .map(|(_, value)| value.trim().trim_matches('"'))
    }

    /// Decode the body using the declared charset. Without one, valid UTF-8
    /// is read as UTF-8 and anything else as Latin-1 (windows-1252).
    pub fn text(&self) -> String {
        let encoding = match self.charset().and_then(|l| Encoding::for_label(l.as_bytes())) {
            Some(encoding) => encoding,
            None if std::str::from_utf8(&self.body).is_ok() => UTF_8,
            None => WINDOWS_1252,
        };
        let (text, _, _) = encoding.decode(&self.body);
        text.into_owned()
    }
}

/// One network attempt. Implementations must not retry on their own.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch_once(&self, url: &Url) -> Result<Fetched, FetchError>;
}

/// `reqwest`-backed fetcher. Non-2xx responses are errors.
#[derive(Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("receipt-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch_once(&self, url: &Url) -> Result<Fetched, FetchError> {
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        if !res.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: res.status().as_u16(),
            });
        }
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = res.bytes().await.map_err(|e| FetchError::Request {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Fetched {
            body: bytes.to_vec(),
            content_type,
        })
    }
}

/// Attempt budget and delay schedule. The delay before retry `k` (1-indexed)
/// is `2^k` seconds plus a uniform jitter in `[0, 1)` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Deterministic part of the schedule; `jitter` must lie in `[0, 1)`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base = 2u64.saturating_pow(attempt);
        Duration::from_secs(base) + Duration::from_secs_f64(jitter.clamp(0.0, 0.999_999))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_jitter(attempt, jitter)
    }
}

/// Retrying GET shared by the catalog client and the markup interpreter.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<dyn Fetch>,
    policy: RetryPolicy,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(inner: Arc<dyn Fetch>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// GET `url`, retrying transient failures. Returns `Exhausted` once the
    /// budget is spent; callers treat that as failed for this cycle only.
    pub async fn get(&self, url: &Url) -> Result<Fetched, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.fetch_once(url).await {
                Ok(fetched) => return Ok(fetched),
                Err(err) if attempt >= self.policy.max_attempts => {
                    error!(url = %url, attempts = attempt, %err, "persistent fetch failure");
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let wait = self.policy.delay(attempt);
                    warn!(
                        url = %url,
                        attempt,
                        %err,
                        "fetch failed; retrying in {:.2} seconds",
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// GET and decode the body as text, honoring the response charset.
    pub async fn get_text(&self, url: &Url) -> Result<String, FetchError> {
        Ok(self.get(url).await?.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct Scripted {
        responses: Mutex<VecDeque<Result<Fetched, FetchError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Fetched, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from(responses)),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Fetch for Scripted {
        async fn fetch_once(&self, url: &Url) -> Result<Fetched, FetchError> {
            *self.calls.lock().await += 1;
            self.responses.lock().await.pop_front().unwrap_or_else(|| {
                Err(FetchError::Status {
                    url: url.to_string(),
                    status: 503,
                })
            })
        }
    }

    fn unavailable() -> Result<Fetched, FetchError> {
        Err(FetchError::Status {
            url: "http://pos.test/x".into(),
            status: 503,
        })
    }

    #[test]
    fn backoff_delay_stays_within_window() {
        let policy = RetryPolicy::new(5);
        for k in 1..policy.max_attempts {
            let floor = Duration::from_secs(2u64.pow(k));
            let ceiling = floor + Duration::from_secs(1);
            for _ in 0..50 {
                let d = policy.delay(k);
                assert!(d >= floor && d < ceiling, "attempt {} delay {:?}", k, d);
            }
        }
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_with_jitter(1, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay_with_jitter(2, 0.0), Duration::from_secs(4));
        assert!(policy.delay_with_jitter(1, 0.99) < policy.delay_with_jitter(2, 0.0));
        assert!(policy.delay_with_jitter(2, 1.5) < Duration::from_secs(5));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let fetch = Arc::new(Scripted::new(vec![unavailable(), Ok(Fetched::new(b"ok".to_vec()))]));
        let transport = Transport::new(fetch.clone(), RetryPolicy::new(3));
        let url = Url::parse("http://pos.test/x").unwrap();
        let body = transport.get(&url).await.unwrap();
        assert_eq!(body.body, b"ok");
        assert_eq!(*fetch.calls.lock().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_then_reports_terminal_error() {
        let fetch = Arc::new(Scripted::new(vec![unavailable(), unavailable(), unavailable()]));
        let transport = Transport::new(fetch.clone(), RetryPolicy::new(3));
        let url = Url::parse("http://pos.test/x").unwrap();
        let started = tokio::time::Instant::now();
        let err = transport.get(&url).await.unwrap_err();
        match err {
            FetchError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(*fetch.calls.lock().await, 3);
        // Two sleeps: [2,3) + [4,5) seconds; none after the final attempt.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn each_call_gets_a_fresh_budget() {
        let fetch = Arc::new(Scripted::new(vec![
            unavailable(),
            unavailable(),
            Ok(Fetched::new(b"second".to_vec())),
        ]));
        let transport = Transport::new(fetch.clone(), RetryPolicy::new(2));
        let url = Url::parse("http://pos.test/x").unwrap();
        assert!(transport.get(&url).await.is_err());
        assert_eq!(transport.get(&url).await.unwrap().body, b"second");
    }

    #[test]
    fn http_fetcher_surfaces_builder_errors_as_reqwest_errors() {
        let built: Result<HttpFetcher, reqwest::Error> = HttpFetcher::new(Duration::from_secs(5));
        assert!(built.is_ok());
    }

    #[test]
    fn declared_latin1_charset_is_honored() {
        let fetched = Fetched::new(b"N;1;A\xf1o".to_vec())
            .with_content_type("text/plain; charset=ISO-8859-1");
        assert_eq!(fetched.charset(), Some("ISO-8859-1"));
        assert_eq!(fetched.text(), "N;1;Año");

        let quoted = Fetched::new(b"\xe1".to_vec()).with_content_type("text/plain;Charset=\"latin1\"");
        assert_eq!(quoted.text(), "á");
    }

    #[test]
    fn undeclared_charset_falls_back_to_latin1_only_when_not_utf8() {
        assert_eq!(Fetched::new("Año".as_bytes().to_vec()).text(), "Año");
        assert_eq!(Fetched::new(b"A\xf1o \xba".to_vec()).text(), "Año º");
        let html = Fetched::new(b"caf\xc3\xa9".to_vec()).with_content_type("text/html");
        assert_eq!(html.charset(), None);
        assert_eq!(html.text(), "café");
    }

    #[test]
    fn declared_utf8_charset_is_honored() {
        let fetched = Fetched::new("Ñandú".as_bytes().to_vec())
            .with_content_type("text/plain; charset=utf-8");
        assert_eq!(fetched.text(), "Ñandú");
    }
}
