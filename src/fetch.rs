use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, USER_AGENT};
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::key::{Key, State, Target, audit_year_label};

pub const DEFAULT_BASE_URL: &str =
    "https://mnregaweb4.nic.in/netnrega/SocialAuditFindings/SA-GPReport.aspx";

const USER_AGENT_VALUE: &str = concat!("sa-findings/", env!("CARGO_PKG_VERSION"));

/// A fetched page. Lives for one fetch/parse cycle.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub target: Target,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("{target}: upstream unavailable after {attempts} attempt(s): {reason}")]
    Unavailable {
        target: Target,
        attempts: u32,
        reason: String,
    },
    #[error("{target}: not found (HTTP {status})")]
    NotFound { target: Target, status: u16 },
}

impl FetchError {
    pub fn target(&self) -> &Target {
        match self {
            FetchError::Unavailable { target, .. } | FetchError::NotFound { target, .. } => target,
        }
    }
}

/// Where pages come from. The driver only talks to this seam.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_listing(&self, state: State, year: u16) -> Result<RawPage, FetchError>;
    async fn fetch(&self, key: &Key) -> Result<RawPage, FetchError>;
    /// The GP-year page narrowed to the gram sabha held on `date` (an option value).
    async fn fetch_gram_sabha(&self, key: &Key, date: &str) -> Result<RawPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: Url,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub backoff: Duration,
    /// Minimum spacing between the starts of any two requests.
    pub min_delay: Duration,
    pub timeout: Duration,
}

impl FetchConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            max_attempts: 4,
            backoff: Duration::from_millis(500),
            min_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide request spacing, shared by every fetch regardless of worker.
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_start: Mutex::new(None),
        }
    }

    /// Waits until `min_delay` has passed since the previous request started.
    /// The lock is held while sleeping so concurrent callers queue up.
    pub async fn wait_turn(&self) {
        let mut last_start = self.last_start.lock().await;
        if let Some(previous) = *last_start {
            tokio::time::sleep_until(previous + self.min_delay).await;
        }
        *last_start = Some(Instant::now());
    }
}

/// Outcome of a single HTTP attempt.
enum Attempt {
    Done { status: u16, html: String },
    Retryable(String),
    Fatal(FetchError),
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    config: FetchConfig,
    limiter: Arc<RateLimiter>,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let limiter = Arc::new(RateLimiter::new(config.min_delay));
        Self::with_limiter(config, limiter)
    }

    pub fn with_limiter(config: FetchConfig, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build upstream http client")?;

        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    pub fn listing_url(&self, state: State, year: u16) -> Url {
        let mut url = self.config.base_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("page", "S")
            .append_pair("lflag", "eng")
            .append_pair("state_code", state.code())
            .append_pair("state_name", state.name())
            .append_pair("audit_year", &audit_year_label(year));
        url
    }

    pub fn gp_url(&self, key: &Key) -> Url {
        let mut url = self.config.base_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("page", "GP")
            .append_pair("lflag", "eng")
            .append_pair("state_code", key.state.code())
            .append_pair("state_name", key.state.name())
            .append_pair("panchayat_code", &key.unit)
            .append_pair("audit_year", &key.audit_year());
        url
    }

    pub fn gram_sabha_url(&self, key: &Key, date: &str) -> Url {
        let mut url = self.gp_url(key);
        url.query_pairs_mut().append_pair("gs_date", date);
        url
    }

    async fn get(&self, target: Target, url: Url) -> Result<RawPage, FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            self.limiter.wait_turn().await;
            match self.attempt(&target, &url).await {
                Attempt::Done { status, html } => {
                    tracing::debug!(page = %target, attempt, status, "fetched");
                    return Ok(RawPage {
                        target,
                        html,
                        fetched_at: Utc::now(),
                        status,
                    });
                }
                Attempt::Fatal(err) => return Err(err),
                Attempt::Retryable(reason) => {
                    tracing::warn!(page = %target, attempt, max_attempts, %reason, "fetch failed");
                    last_reason = reason;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff_for(attempt)).await;
                    }
                }
            }
        }

        Err(FetchError::Unavailable {
            target,
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.config.backoff.saturating_mul(1_u32 << exponent)
    }

    async fn attempt(&self, target: &Target, url: &Url) -> Attempt {
        let response = match self
            .client
            .get(url.clone())
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Attempt::Retryable(format!("GET {url}: {err}")),
        };

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Attempt::Retryable(format!("HTTP {status}"));
        }
        if status.is_client_error() {
            return Attempt::Fatal(FetchError::NotFound {
                target: target.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Attempt::Retryable(format!("unexpected HTTP {status}"));
        }

        match response.text().await {
            Ok(html) => Attempt::Done {
                status: status.as_u16(),
                html,
            },
            Err(err) => Attempt::Retryable(format!("read body: {err}")),
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_listing(&self, state: State, year: u16) -> Result<RawPage, FetchError> {
        let url = self.listing_url(state, year);
        self.get(Target::Listing { state, year }, url).await
    }

    async fn fetch(&self, key: &Key) -> Result<RawPage, FetchError> {
        let url = self.gp_url(key);
        self.get(Target::GpYear(key.clone()), url).await
    }

    async fn fetch_gram_sabha(&self, key: &Key, date: &str) -> Result<RawPage, FetchError> {
        let url = self.gram_sabha_url(key, date);
        let target = Target::GramSabha {
            key: key.clone(),
            date: date.to_owned(),
        };
        self.get(target, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(backoff_ms: u64) -> anyhow::Result<HttpFetcher> {
        let mut config = FetchConfig::new(Url::parse("http://upstream.test/SA-GPReport.aspx")?);
        config.backoff = Duration::from_millis(backoff_ms);
        HttpFetcher::new(config)
    }

    #[test]
    fn gp_url_is_built_from_key_fields() -> anyhow::Result<()> {
        let url = fetcher(500)?.gp_url(&Key::new(State::TamilNadu, "GP 7&8", 2015));
        assert_eq!(
            url.as_str(),
            "http://upstream.test/SA-GPReport.aspx?page=GP&lflag=eng&state_code=29\
             &state_name=TAMIL+NADU&panchayat_code=GP+7%268&audit_year=2015-2016"
        );
        Ok(())
    }

    #[test]
    fn listing_url_has_no_unit() -> anyhow::Result<()> {
        let url = fetcher(500)?.listing_url(State::Kerala, 2019);
        assert_eq!(
            url.query(),
            Some("page=S&lflag=eng&state_code=16&state_name=KERALA&audit_year=2019-2020")
        );
        Ok(())
    }

    #[test]
    fn gram_sabha_url_narrows_the_gp_year_page() -> anyhow::Result<()> {
        let url = fetcher(500)?.gram_sabha_url(&Key::new(State::Meghalaya, "2104005", 2019), "14/08/2019");
        assert_eq!(
            url.query(),
            Some(
                "page=GP&lflag=eng&state_code=21&state_name=MEGHALAYA&panchayat_code=2104005\
                 &audit_year=2019-2020&gs_date=14%2F08%2F2019"
            )
        );
        Ok(())
    }

    #[test]
    fn backoff_doubles_per_attempt() -> anyhow::Result<()> {
        let fetcher = fetcher(100)?;
        assert_eq!(fetcher.backoff_for(1), Duration::from_millis(100));
        assert_eq!(fetcher.backoff_for(2), Duration::from_millis(200));
        assert_eq!(fetcher.backoff_for(4), Duration::from_millis(800));
        Ok(())
    }
}
