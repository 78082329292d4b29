//! Page analyzer contracts + fixture and HTTP analyzer implementations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dip_core::{validate_domain, DomainProfile};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dip-adapters";

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("no analysis available for {0}")]
    Unavailable(String),
    #[error("analyzer returned http status {status} for {domain}")]
    HttpStatus { status: u16, domain: String },
    #[error("analyzer request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("analyzer returned an invalid profile for {domain}: {reason}")]
    InvalidProfile { domain: String, reason: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Inspects a live site and produces a first-draft profile.
#[async_trait]
pub trait PageAnalyzer: Send + Sync {
    async fn create_profile(
        &self,
        domain: &str,
        initial_url: Option<&str>,
    ) -> Result<DomainProfile, AnalyzerError>;
}

/// Structural checks applied to everything an analyzer hands back.
pub fn validate_analyzer_profile(domain: &str, profile: &DomainProfile) -> Result<(), AnalyzerError> {
    let invalid = |reason: String| AnalyzerError::InvalidProfile {
        domain: domain.to_string(),
        reason,
    };

    if profile.domain != domain {
        return Err(invalid(format!("profile is for {:?}", profile.domain)));
    }
    if validate_domain(&profile.domain).is_err() {
        return Err(invalid("domain is not a valid host".to_string()));
    }
    if profile.version.trim().is_empty() {
        return Err(invalid("missing version".to_string()));
    }
    if profile.optimal_strategy.preferred.trim().is_empty() {
        return Err(invalid("missing preferred strategy".to_string()));
    }
    for (name, value) in [
        ("metadata.confidence_score", profile.metadata.confidence_score),
        ("optimal_strategy.confidence", profile.optimal_strategy.confidence),
        ("performance_metrics.success_rate", profile.performance_metrics.success_rate),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(invalid(format!("{name} out of range: {value}")));
        }
    }
    Ok(())
}

/// Serves pre-captured analyses from `<root>/<domain>/profile.json`.
///
/// Ports are encoded as `_` in the directory name (`localhost_8080`).
#[derive(Debug, Clone)]
pub struct FixturePageAnalyzer {
    root: PathBuf,
}

impl FixturePageAnalyzer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fixture_path(&self, domain: &str) -> PathBuf {
        self.root
            .join(domain.replace(':', "_"))
            .join("profile.json")
    }
}

#[async_trait]
impl PageAnalyzer for FixturePageAnalyzer {
    async fn create_profile(
        &self,
        domain: &str,
        _initial_url: Option<&str>,
    ) -> Result<DomainProfile, AnalyzerError> {
        let path = self.fixture_path(domain);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking fixture {}", path.display()))?
        {
            return Err(AnalyzerError::Unavailable(domain.to_string()));
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading fixture {}", path.display()))?;
        let profile: DomainProfile = serde_json::from_str(&text)
            .with_context(|| format!("parsing fixture {}", path.display()))?;
        validate_analyzer_profile(domain, &profile)?;
        debug!(domain, path = %path.display(), "loaded fixture analysis");
        Ok(profile)
    }
}

/// What the analyzer service meant by a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerReply {
    /// The body is a profile document.
    Profile,
    /// The service has no analysis for the domain.
    NoAnalysis,
    /// Overloaded or briefly down; worth asking again.
    Busy,
    /// The request itself was refused.
    Refused,
}

pub fn classify_reply(status: StatusCode) -> AnalyzerReply {
    match status {
        s if s.is_success() => AnalyzerReply::Profile,
        StatusCode::NOT_FOUND | StatusCode::GONE => AnalyzerReply::NoAnalysis,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => AnalyzerReply::Busy,
        _ => AnalyzerReply::Refused,
    }
}

/// The analyzer never saw the request, or did not answer in time.
fn transport_is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Delay-seconds form of `Retry-After`. HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// How often and how patiently a busy analyzer is asked again. `attempts`
/// counts the first request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub first_pause: Duration,
    pub pause_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            first_pause: Duration::from_millis(500),
            pause_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (0-based): doubling from
    /// `first_pause`, or the server's hint when it sent one. Both are capped.
    pub fn pause(&self, retry: usize, hint: Option<Duration>) -> Duration {
        let doubled = self
            .first_pause
            .saturating_mul(2u32.saturating_pow(retry.min(31) as u32));
        hint.unwrap_or(doubled).min(self.pause_cap)
    }
}

async fn read_profile(domain: &str, resp: reqwest::Response) -> Result<DomainProfile, AnalyzerError> {
    let body = resp.bytes().await?;
    let profile: DomainProfile =
        serde_json::from_slice(&body).map_err(|err| AnalyzerError::InvalidProfile {
            domain: domain.to_string(),
            reason: format!("unparseable body: {err}"),
        })?;
    validate_analyzer_profile(domain, &profile)?;
    Ok(profile)
}

#[derive(Debug, Clone)]
pub struct HttpAnalyzerConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl HttpAnalyzerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(60),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    domain: &'a str,
    initial_url: Option<&'a str>,
}

/// Client for a remote analyzer service: `POST {endpoint}` with
/// `{domain, initial_url}`, answered by a profile document.
#[derive(Debug)]
pub struct HttpPageAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpPageAnalyzer {
    pub fn new(config: HttpAnalyzerConfig) -> anyhow::Result<Self> {
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
            endpoint: config.endpoint,
            retry: config.retry,
        })
    }

    async fn request_profile(
        &self,
        domain: &str,
        initial_url: Option<&str>,
    ) -> Result<DomainProfile, AnalyzerError> {
        let body = AnalyzeRequest { domain, initial_url };
        let mut retry = 0;

        loop {
            let last = retry + 1 >= self.retry.attempts;
            let pause = match self.client.post(&self.endpoint).json(&body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    match classify_reply(status) {
                        AnalyzerReply::Profile => return read_profile(domain, resp).await,
                        AnalyzerReply::NoAnalysis => {
                            return Err(AnalyzerError::Unavailable(domain.to_string()))
                        }
                        AnalyzerReply::Busy if !last => {
                            let pause = self.retry.pause(retry, retry_after(resp.headers()));
                            warn!(%status, retry, pause_ms = pause.as_millis() as u64, "analyzer busy");
                            pause
                        }
                        AnalyzerReply::Busy | AnalyzerReply::Refused => {
                            return Err(AnalyzerError::HttpStatus {
                                status: status.as_u16(),
                                domain: domain.to_string(),
                            })
                        }
                    }
                }
                Err(err) if transport_is_transient(&err) && !last => {
                    warn!(error = %err, retry, "analyzer unreachable");
                    self.retry.pause(retry, None)
                }
                Err(err) => return Err(AnalyzerError::Request(err)),
            };
            tokio::time::sleep(pause).await;
            retry += 1;
        }
    }
}

#[async_trait]
impl PageAnalyzer for HttpPageAnalyzer {
    async fn create_profile(
        &self,
        domain: &str,
        initial_url: Option<&str>,
    ) -> Result<DomainProfile, AnalyzerError> {
        let span = info_span!("analyzer_http", domain, endpoint = %self.endpoint);
        self.request_profile(domain, initial_url).instrument(span).await
    }
}
