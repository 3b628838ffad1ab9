//! Download Engine for the image scraper
//!
//! This module provides the fetch stage of the pipeline:
//! 1. One output slot per input locator, in input order
//! 2. Bounded concurrency through a semaphore
//! 3. A fixed timeout per retrieval
//! 4. Optional retries with exponential backoff
//! 5. Failures recorded as absent slots, never raised to the caller

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indicatif::ProgressBar;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::scraper::{AppConfig, Payload};

/// Why a single retrieval produced no payload.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Malformed locator or response: {0}")]
    Malformed(String),

    #[error("Fetch task aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connect(_) | FetchError::Body(_) => true,
            FetchError::Status(code) => *code == 429 || *code >= 500,
            FetchError::Request(e) => e.is_timeout() || e.is_connect(),
            FetchError::Malformed(_) | FetchError::Aborted(_) => false,
        }
    }
}

/// Result type for a single retrieval
pub type FetchResult<T> = Result<T, FetchError>;

/// Retrieves the raw content behind one locator.
pub trait Source {
    fn fetch(&self, locator: &str) -> impl Future<Output = FetchResult<Payload>> + Send;
}

/// [`Source`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(user_agent: &str, request_timeout: Duration) -> FetchResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .gzip(true)
            .tcp_nodelay(true)
            .build()?;

        Ok(Self { client })
    }
}

impl Source for HttpSource {
    async fn fetch(&self, locator: &str) -> FetchResult<Payload> {
        let url = reqwest::Url::parse(locator).map_err(|e| FetchError::Malformed(format!("{}: {}", locator, e)))?;

        let response = self.client.get(url).send().await.map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                classify_request_error(e)
            } else {
                FetchError::Body(e.to_string())
            }
        })?;

        Ok(Payload::new(body.to_vec()))
    }
}

fn classify_request_error(e: reqwest::Error) -> FetchError {
    if e.is_connect() {
        FetchError::Connect(e.to_string())
    } else if e.is_builder() {
        FetchError::Malformed(e.to_string())
    } else {
        FetchError::Request(e)
    }
}

/// Fetch stage configuration
#[derive(Debug, Clone)]
pub struct DownloadEngineConfig {
    pub max_concurrent_downloads: usize,
    pub timeout: Duration,
    pub retry_attempts: usize,
    pub base_retry_delay_ms: u64,
}

impl Default for DownloadEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 1,
            timeout: Duration::from_secs(45),
            retry_attempts: 0,
            base_retry_delay_ms: 1000,
        }
    }
}

impl DownloadEngineConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent_downloads: config.fetch.concurrency.max(1),
            timeout: config.fetch_timeout(),
            retry_attempts: config.fetch.retry_attempts,
            base_retry_delay_ms: config.fetch.base_retry_delay_ms,
        }
    }
}

/// What happened to one locator.
#[derive(Debug)]
pub struct FetchOutcome {
    pub locator: String,
    pub attempts: usize,
    pub result: FetchResult<Payload>,
}

impl FetchOutcome {
    pub fn into_slot(self) -> Option<Payload> {
        self.result.ok()
    }
}

/// Download statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStats {
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub bytes_downloaded: u64,
}

impl DownloadStats {
    pub fn from_outcomes(outcomes: &[FetchOutcome]) -> Self {
        outcomes.iter().fold(
            Self {
                total_jobs: outcomes.len(),
                ..Self::default()
            },
            |mut stats, outcome| {
                match &outcome.result {
                    Ok(payload) => {
                        stats.completed_jobs += 1;
                        stats.bytes_downloaded += payload.len() as u64;
                    }
                    Err(_) => stats.failed_jobs += 1,
                }
                stats
            },
        )
    }
}

/// Runs a [`Source`] over a list of locators with bounded concurrency.
pub struct DownloadEngine<S> {
    config: DownloadEngineConfig,
    source: Arc<S>,
    semaphore: Arc<Semaphore>,
    progress: Option<ProgressBar>,
}

impl<S: Source> DownloadEngine<S> {
    pub fn new(config: DownloadEngineConfig, source: S) -> Self {
        let permits = config.max_concurrent_downloads.max(1);
        Self {
            config,
            source: Arc::new(source),
            semaphore: Arc::new(Semaphore::new(permits)),
            progress: None,
        }
    }

    /// Ticks the bar once per finished locator.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Fetches every locator. The result has exactly one outcome per locator, in input order;
    /// [`FetchOutcome::into_slot`] turns each into a present or absent slot.
    #[instrument(skip_all, fields(locators = locators.len(), concurrency = self.config.max_concurrent_downloads))]
    pub async fn fetch(&self, locators: &[String]) -> Vec<FetchOutcome> {
        info!("Downloading {} images", locators.len());
        if let Some(progress) = &self.progress {
            progress.set_length(locators.len() as u64);
        }

        // join_all yields in input order, so completion order never reorders slots
        let outcomes = join_all(
            locators
                .iter()
                .enumerate()
                .map(|(index, locator)| self.fetch_slot(index, locator)),
        )
        .await;

        let stats = DownloadStats::from_outcomes(&outcomes);
        info!(
            "Downloaded {} of {} images ({} failed, {} bytes)",
            stats.completed_jobs, stats.total_jobs, stats.failed_jobs, stats.bytes_downloaded
        );

        outcomes
    }

    async fn fetch_slot(&self, index: usize, locator: &str) -> FetchOutcome {
        let outcome = match self.semaphore.acquire().await {
            Ok(_permit) => {
                info!("Attempting to download {}.", locator);
                let (attempts, result) = self.fetch_with_retry(locator).await;
                FetchOutcome {
                    locator: locator.to_string(),
                    attempts,
                    result,
                }
            }
            Err(e) => FetchOutcome {
                locator: locator.to_string(),
                attempts: 0,
                result: Err(FetchError::Aborted(e.to_string())),
            },
        };

        match &outcome.result {
            Ok(payload) => debug!(slot = index, bytes = payload.len(), "Downloaded {}", locator),
            Err(e) => warn!(slot = index, "Failed to download {} ({})...skipping.", locator, e),
        }

        if let Some(progress) = &self.progress {
            progress.inc(1);
        }

        outcome
    }

    async fn fetch_with_retry(&self, locator: &str) -> (usize, FetchResult<Payload>) {
        let max_attempts = self.config.retry_attempts + 1;
        let mut attempts = 0;

        loop {
            attempts += 1;

            if attempts > 1 {
                info!("Retry attempt {}/{} for {}", attempts, max_attempts, locator);
            }

            let result = match timeout(self.config.timeout, self.source.fetch(locator)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(self.config.timeout)),
            };

            match result {
                Ok(payload) => return (attempts, Ok(payload)),
                Err(e) if attempts < max_attempts && e.is_retryable() => {
                    let backoff = calculate_backoff(attempts, self.config.base_retry_delay_ms);
                    debug!("{} failed ({}), backing off for {}ms", locator, e, backoff);
                    sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return (attempts, Err(e)),
            }
        }
    }
}

/// Exponential backoff: `2^(attempt-1) * base`, capped at 60 seconds.
pub fn calculate_backoff(attempt: usize, base_delay_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16) as u32;
    let max_delay = 60_000;

    let delay = (1u64 << exponent).saturating_mul(base_delay_ms);
    std::cmp::min(delay, max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Serves canned payloads; any locator without one fails with a connect error.
    struct ScriptedSource {
        payloads: HashMap<String, Vec<u8>>,
        delays: HashMap<String, Duration>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                payloads: HashMap::new(),
                delays: HashMap::new(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn serve(mut self, locator: &str, body: &[u8]) -> Self {
            self.payloads.insert(locator.to_string(), body.to_vec());
            self
        }

        fn delay(mut self, locator: &str, delay: Duration) -> Self {
            self.delays.insert(locator.to_string(), delay);
            self
        }
    }

    impl Source for ScriptedSource {
        async fn fetch(&self, locator: &str) -> FetchResult<Payload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delays.get(locator) {
                sleep(*delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.payloads.get(locator) {
                Some(body) => Ok(Payload::new(body.clone())),
                None => Err(FetchError::Connect(format!("refused: {}", locator))),
            }
        }
    }

    /// Fails with `error` for the first `failures` calls, then serves `body`.
    struct FlakySource {
        failures: usize,
        error: fn() -> FetchError,
        body: Vec<u8>,
        calls: AtomicUsize,
    }

    impl Source for FlakySource {
        async fn fetch(&self, _locator: &str) -> FetchResult<Payload> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok(Payload::new(self.body.clone()))
            }
        }
    }

    fn slots(outcomes: Vec<FetchOutcome>) -> Vec<Option<Payload>> {
        outcomes.into_iter().map(FetchOutcome::into_slot).collect()
    }

    fn locators(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("loc-{}", i)).collect()
    }

    fn quick_config(concurrency: usize) -> DownloadEngineConfig {
        DownloadEngineConfig {
            max_concurrent_downloads: concurrency,
            timeout: Duration::from_secs(5),
            retry_attempts: 0,
            base_retry_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_failed_slots_are_absent_and_positional() {
        let source = ScriptedSource::new()
            .serve("loc-0", b"img")
            .serve("loc-1", b"img")
            .serve("loc-3", b"img");
        let engine = DownloadEngine::new(quick_config(1), source);

        let slots = slots(engine.fetch(&locators(5)).await);
        assert_eq!(slots.len(), 5);
        assert_eq!(slots[0], Some(Payload::new(b"img".to_vec())));
        assert_eq!(slots[1], Some(Payload::new(b"img".to_vec())));
        assert_eq!(slots[2], None);
        assert_eq!(slots[3], Some(Payload::new(b"img".to_vec())));
        assert_eq!(slots[4], None);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let engine = DownloadEngine::new(quick_config(4), ScriptedSource::new());
        assert!(engine.fetch(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_order_survives_out_of_order_completion() {
        let source = ScriptedSource::new()
            .serve("loc-0", b"a")
            .serve("loc-1", b"b")
            .serve("loc-2", b"c")
            .delay("loc-0", Duration::from_millis(120))
            .delay("loc-1", Duration::from_millis(60));
        let engine = DownloadEngine::new(quick_config(3), source);

        let slots = slots(engine.fetch(&locators(3)).await);
        let bodies: Vec<_> = slots.into_iter().map(|s| s.unwrap().to_vec()).collect();
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let mut source = ScriptedSource::new();
        for locator in locators(8) {
            source = source
                .serve(&locator, b"x")
                .delay(&locator, Duration::from_millis(30));
        }
        let engine = DownloadEngine::new(quick_config(3), source);

        let outcomes = engine.fetch(&locators(8)).await;
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        let peak = engine.source.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in flight was {}", peak);
        assert!(peak >= 2, "fetches never overlapped");
    }

    #[tokio::test]
    async fn test_sequential_by_default() {
        let mut source = ScriptedSource::new();
        for locator in locators(4) {
            source = source
                .serve(&locator, b"x")
                .delay(&locator, Duration::from_millis(10));
        }
        let engine = DownloadEngine::new(DownloadEngineConfig::default(), source);
        engine.fetch(&locators(4)).await;
        assert_eq!(engine.source.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_marks_slot_absent() {
        let source = ScriptedSource::new()
            .serve("loc-0", b"slow")
            .serve("loc-1", b"fast")
            .delay("loc-0", Duration::from_secs(5));
        let config = DownloadEngineConfig {
            timeout: Duration::from_millis(50),
            ..quick_config(2)
        };
        let engine = DownloadEngine::new(config, source);

        let outcomes = engine.fetch(&locators(2)).await;
        assert!(matches!(outcomes[0].result, Err(FetchError::Timeout(_))));
        assert_eq!(outcomes[1].result.as_ref().unwrap().as_bytes(), b"fast");
    }

    #[tokio::test]
    async fn test_no_retry_by_default() {
        let engine = DownloadEngine::new(quick_config(1), ScriptedSource::new());
        let outcomes = engine.fetch(&locators(1)).await;
        assert_eq!(outcomes[0].attempts, 1);
        assert_eq!(engine.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_gives_up() {
        let config = DownloadEngineConfig {
            retry_attempts: 2,
            ..quick_config(1)
        };
        let engine = DownloadEngine::new(config, ScriptedSource::new());

        let outcomes = engine.fetch(&locators(1)).await;
        assert_eq!(outcomes[0].attempts, 3);
        assert!(matches!(outcomes[0].result, Err(FetchError::Connect(_))));
        assert_eq!(engine.source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let source = FlakySource {
            failures: 1,
            error: || FetchError::Status(503),
            body: b"late".to_vec(),
            calls: AtomicUsize::new(0),
        };
        let config = DownloadEngineConfig {
            retry_attempts: 2,
            ..quick_config(1)
        };
        let engine = DownloadEngine::new(config, source);

        let outcomes = engine.fetch(&locators(1)).await;
        assert_eq!(outcomes[0].attempts, 2);
        assert_eq!(outcomes[0].result.as_ref().unwrap().as_bytes(), b"late");
        assert_eq!(engine.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        for error in [
            (|| FetchError::Status(404)) as fn() -> FetchError,
            || FetchError::Malformed("not a url".into()),
        ] {
            let source = FlakySource {
                failures: usize::MAX,
                error,
                body: Vec::new(),
                calls: AtomicUsize::new(0),
            };
            let config = DownloadEngineConfig {
                retry_attempts: 3,
                ..quick_config(1)
            };
            let engine = DownloadEngine::new(config, source);

            let outcomes = engine.fetch(&locators(1)).await;
            assert_eq!(outcomes[0].attempts, 1);
            assert!(outcomes[0].result.is_err());
            assert_eq!(engine.source.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_failures_stay_isolated_under_concurrency() {
        // Odd slots fail, and completion order is the reverse of input order
        let mut source = ScriptedSource::new();
        for (i, locator) in locators(6).iter().enumerate() {
            if i % 2 == 0 {
                source = source.serve(locator, format!("body-{}", i).as_bytes());
            }
            source = source.delay(locator, Duration::from_millis(20 * (6 - i as u64)));
        }
        let engine = DownloadEngine::new(quick_config(6), source);

        let outcomes = engine.fetch(&locators(6)).await;
        assert_eq!(outcomes.len(), 6);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.locator, format!("loc-{}", i));
            if i % 2 == 0 {
                let expected = format!("body-{}", i);
                assert_eq!(outcome.result.as_ref().unwrap().as_bytes(), expected.as_bytes());
            } else {
                assert!(matches!(outcome.result, Err(FetchError::Connect(_))));
            }
        }
        assert!(engine.source.max_in_flight.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(1, 1000), 1000);
        assert_eq!(calculate_backoff(2, 1000), 2000);
        assert_eq!(calculate_backoff(3, 1000), 4000);
        assert_eq!(calculate_backoff(10, 1000), 60_000);
        assert_eq!(calculate_backoff(100, 1000), 60_000);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(FetchError::Status(503).is_retryable());
        assert!(FetchError::Status(429).is_retryable());
        assert!(!FetchError::Status(404).is_retryable());
        assert!(!FetchError::Malformed("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_http_source_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\xff\xd8jpeg".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty.jpg"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let source = HttpSource::new("test-agent", Duration::from_secs(5)).unwrap();
        let engine = DownloadEngine::new(quick_config(2), source);

        let locators = vec![
            format!("{}/ok.jpg", server.uri()),
            format!("{}/missing.jpg", server.uri()),
            "not a url".to_string(),
            format!("{}/empty.jpg", server.uri()),
        ];
        let outcomes = engine.fetch(&locators).await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0].result.as_ref().unwrap().as_bytes(), b"\xff\xd8jpeg");
        assert!(matches!(outcomes[1].result, Err(FetchError::Status(404))));
        assert!(matches!(outcomes[2].result, Err(FetchError::Malformed(_))));
        // An empty body is present, not absent
        assert!(outcomes[3].result.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_source_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let source = HttpSource::new("test-agent", Duration::from_secs(30)).unwrap();
        let config = DownloadEngineConfig {
            timeout: Duration::from_millis(100),
            ..quick_config(1)
        };
        let engine = DownloadEngine::new(config, source);

        let slots = slots(engine.fetch(&[format!("{}/slow.jpg", server.uri())]).await);
        assert_eq!(slots, vec![None]);
    }

    #[test]
    fn test_stats_from_outcomes() {
        let outcomes = vec![
            FetchOutcome {
                locator: "a".into(),
                attempts: 1,
                result: Ok(Payload::new(vec![0u8; 10])),
            },
            FetchOutcome {
                locator: "b".into(),
                attempts: 1,
                result: Err(FetchError::Status(500)),
            },
        ];
        let stats = DownloadStats::from_outcomes(&outcomes);
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.completed_jobs, 1);
        assert_eq!(stats.failed_jobs, 1);
        assert_eq!(stats.bytes_downloaded, 10);
    }
}
