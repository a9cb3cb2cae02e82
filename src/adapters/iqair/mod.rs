//! IQAir adapter — current conditions for a list of cities via the
//! AirVisual `/city` endpoint.
//!
//! Every request is gated by the local [`QuotaTracker`]; a denial (or an
//! HTTP 429 from IQAir) is surfaced as a retryable quota outcome after
//! waiting out the backoff, bounded by the configured sleep ceiling.

mod payload;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{Adapter, FetchError, Outcome, PollTarget, QuotaScope, TargetFetcher};
use crate::metrics::{MetricKind, MetricsSink};
use crate::poller::{Poller, PollerSettings};
use crate::publisher::{self, Reading};
use crate::quota::{QuotaLimits, QuotaTracker};
use crate::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

use payload::{ApiResponse, CityData};

pub const PROVIDER_ID: &str = "iqair";
pub const DISPLAY_NAME: &str = "IQAir";
pub const METRIC_PREFIX: &str = "airquality_iqair";

/// IQAir does not say how long to wait after a 429.
const PROVIDER_BACKOFF: Duration = Duration::from_secs(60);

/// Longest response body excerpt carried into error messages.
const BODY_EXCERPT: usize = 500;

// ── Configuration ───────────────────────────────────────────────────

/// What to do when a backoff exceeds `backoff_sleep_ceiling`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CeilingPolicy {
    /// Sleep for the ceiling, then let the retry policy try again.
    #[default]
    Clamp,
    /// Don't sleep at all; hand the backoff straight to the retry policy.
    Propagate,
}

fn default_api_base_url() -> String {
    "https://api.airvisual.com/".into()
}
fn default_api_version() -> String {
    "v2".into()
}
fn default_limit_minute() -> u64 {
    5
}
fn default_limit_day() -> u64 {
    500
}
fn default_limit_month() -> u64 {
    10_000
}
fn default_polling_interval() -> u64 {
    3600
}
fn default_backoff_ceiling() -> u64 {
    120
}
fn default_retry_attempts() -> Option<u32> {
    Some(DEFAULT_MAX_ATTEMPTS)
}
fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct IqAirConfig {
    pub api_key: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_limit_minute")]
    pub api_query_limit_minute: u64,
    #[serde(default = "default_limit_day")]
    pub api_query_limit_day: u64,
    #[serde(default = "default_limit_month")]
    pub api_query_limit_month: u64,
    #[serde(default)]
    pub targets: Vec<IqAirTarget>,
    /// Seconds between polling cycles.
    #[serde(default = "default_polling_interval")]
    pub target_polling_interval: u64,
    /// Longest single backoff sleep, seconds.
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_sleep_ceiling: u64,
    #[serde(default)]
    pub backoff_ceiling_policy: CeilingPolicy,
    #[serde(default)]
    pub enforce_month_limit: bool,
    /// `null` retries forever.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: Option<u32>,
    /// Pause between retry attempts, seconds.
    #[serde(default)]
    pub retry_delay: Option<u64>,
    /// Per-request HTTP timeout, seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Unrecognised keys, reported and otherwise ignored.
    #[serde(flatten)]
    pub ignored: BTreeMap<String, Value>,
}

impl IqAirConfig {
    pub fn from_settings(settings: &Map<String, Value>) -> Result<Self> {
        let config: Self = serde_json::from_value(Value::Object(settings.clone()))
            .context("Invalid IQAir adapter settings")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            bail!("IQAir 'api_key' must not be empty");
        }
        if self.api_version.trim_matches('/').is_empty() {
            bail!("IQAir 'api_version' must not be empty");
        }
        if self.target_polling_interval == 0 {
            bail!("IQAir 'target_polling_interval' must be at least 1 second");
        }
        if self.api_query_limit_minute == 0 || self.api_query_limit_day == 0 {
            bail!("IQAir request limits must be positive");
        }
        Ok(())
    }

    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            minute: self.api_query_limit_minute,
            day: self.api_query_limit_day,
            month: self.api_query_limit_month,
        }
    }

    /// `<base>/<version>/city`. The version segment replaces any path
    /// already on the base URL.
    pub fn endpoint(&self) -> Result<Url> {
        let base = Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid IQAir 'api_base_url': {}", self.api_base_url))?;
        let version = format!("/{}/", self.api_version.trim_matches('/'));
        Ok(base.join(&version)?.join("city")?)
    }

    pub fn poller_settings(&self) -> PollerSettings {
        let retry = match self.retry_attempts {
            Some(n) => RetryPolicy::bounded(n),
            None => RetryPolicy::unbounded(),
        };
        let retry = match self.retry_delay {
            Some(secs) => retry.with_delay(Duration::from_secs(secs)),
            None => retry,
        };
        PollerSettings {
            interval: Duration::from_secs(self.target_polling_interval),
            retry,
        }
    }
}

/// A city to poll, as IQAir names it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IqAirTarget {
    pub country: String,
    pub state: String,
    pub city: String,
}

impl fmt::Display for IqAirTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.city, self.state, self.country)
    }
}

impl PollTarget for IqAirTarget {
    fn labels(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("country", self.country.as_str()),
            ("state", self.state.as_str()),
            ("city", self.city.as_str()),
        ]
    }
}

// ── Client ──────────────────────────────────────────────────────────

pub struct IqAirClient {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    quota: QuotaTracker,
    backoff_ceiling: Duration,
    ceiling_policy: CeilingPolicy,
    sink: Arc<dyn MetricsSink>,
}

impl IqAirClient {
    pub fn new(config: &IqAirConfig, sink: Arc<dyn MetricsSink>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .context("Failed to build HTTP client")?;

        let counters = [
            ("usage_requests_total", "Total requests made to the IQAir API"),
            ("backoff_time_total", "Seconds spent waiting out IQAir usage limits"),
            ("errors", "IQAir adapter errors"),
        ];
        for (suffix, help) in counters {
            sink.init(&format!("{}_{}", METRIC_PREFIX, suffix), MetricKind::Counter, help);
        }

        Ok(Self {
            client,
            endpoint: config.endpoint()?,
            api_key: config.api_key.clone(),
            quota: QuotaTracker::new(config.limits()).enforce_month(config.enforce_month_limit),
            backoff_ceiling: Duration::from_secs(config.backoff_sleep_ceiling),
            ceiling_policy: config.backoff_ceiling_policy,
            sink,
        })
    }

    /// Swap in a different tracker (e.g. one on a fixed clock).
    #[cfg(test)]
    pub fn with_quota(mut self, quota: QuotaTracker) -> Self {
        self.quota = quota;
        self
    }

    #[cfg(test)]
    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn metric(&self, suffix: &str) -> String {
        format!("{}_{}", METRIC_PREFIX, suffix)
    }

    /// One classified request for `target`. Publishes the reading on success.
    pub async fn attempt(&mut self, target: &IqAirTarget) -> Outcome {
        if let Err(denial) = self.quota.check_limits() {
            warn!(
                target = %target,
                backoff_secs = denial.backoff.as_secs(),
                "IQAir API usage hit the {} limit",
                denial.window
            );
            return Outcome::QuotaExceeded {
                scope: QuotaScope::Window(denial.window),
                backoff: denial.backoff,
            };
        }

        debug!(url = %self.endpoint, target = %target, "IQAir API request");
        let sent = self
            .client
            .get(self.endpoint.clone())
            .query(&[
                ("city", target.city.as_str()),
                ("state", target.state.as_str()),
                ("country", target.country.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await;

        let response = match sent {
            Ok(resp) => resp,
            // reqwest errors carry the full URL, api key included
            Err(e) => return Outcome::Fatal(format!("IQAir API request failed: {}", e.without_url())),
        };

        let total = self.quota.record_request();
        self.sink.inc(&self.metric("usage_requests_total"), 1.0, &[]);

        let status = response.status();
        debug!(status = status.as_u16(), total_requests = total, "IQAir API response");

        if status == StatusCode::TOO_MANY_REQUESTS {
            error!(
                target = %target,
                total_requests = total,
                "IQAir API responded with 429 Too Many Requests"
            );
            return Outcome::QuotaExceeded {
                scope: QuotaScope::Provider,
                backoff: PROVIDER_BACKOFF,
            };
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Outcome::Fatal(format!(
                    "Failed to read IQAir API response: {}",
                    e.without_url()
                ))
            }
        };

        if status != StatusCode::OK {
            return Outcome::ApiError(format!(
                "IQAir API request failed ({}): {}",
                status.as_u16(),
                excerpt(&body)
            ));
        }

        match parse_reading(&body) {
            Ok(reading) => {
                let labels = [
                    ("provider", DISPLAY_NAME),
                    ("city", target.city.as_str()),
                    ("state", target.state.as_str()),
                    ("country", target.country.as_str()),
                ];
                publisher::publish(&*self.sink, &reading, &labels);
                debug!(target = %target, aqi_us = reading.aqi_us, "Reading published");
                Outcome::Success
            }
            Err(outcome) => outcome,
        }
    }

    /// Sleep off a quota backoff, bounded by the ceiling policy.
    async fn wait_out(&self, backoff: Duration) {
        let sleep_for = if backoff < self.backoff_ceiling {
            backoff
        } else {
            match self.ceiling_policy {
                CeilingPolicy::Clamp => self.backoff_ceiling,
                CeilingPolicy::Propagate => {
                    warn!(
                        backoff_secs = backoff.as_secs(),
                        ceiling_secs = self.backoff_ceiling.as_secs(),
                        "Backoff exceeds the sleep ceiling, not waiting"
                    );
                    return;
                }
            }
        };

        if sleep_for.is_zero() {
            return;
        }

        warn!("Sleeping for {} sec to back off from usage limits", sleep_for.as_secs());
        tokio::time::sleep(sleep_for).await;
        self.sink
            .inc(&self.metric("backoff_time_total"), sleep_for.as_secs_f64(), &[]);
    }
}

/// Classify a 200 body: a reading, or the outcome to report instead.
fn parse_reading(body: &str) -> std::result::Result<Reading, Outcome> {
    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| Outcome::Fatal(format!("Malformed IQAir API response: {}", e)))?;

    if !response.is_success() {
        return Err(Outcome::ApiError(format!(
            "IQAir API didn't return a success: status={} message={}",
            response.status,
            response.failure_message().unwrap_or("-")
        )));
    }

    let data: CityData = serde_json::from_value(response.data)
        .map_err(|e| Outcome::Fatal(format!("Unexpected IQAir API payload: {}", e)))?;
    Ok(data.into())
}

fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT).collect()
}

#[async_trait]
impl TargetFetcher for IqAirClient {
    type Target = IqAirTarget;

    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn metric_prefix(&self) -> &str {
        METRIC_PREFIX
    }

    async fn fetch(&mut self, target: &IqAirTarget) -> Result<Outcome, FetchError> {
        let outcome = self.attempt(target).await;

        if let Some(reason) = outcome.error_reason() {
            self.sink.inc(
                &self.metric("errors"),
                1.0,
                &[("area", "retrieve_data"), ("reason", reason)],
            );
        }

        match &outcome {
            Outcome::Success => {}
            Outcome::QuotaExceeded { scope, backoff } => {
                warn!(target = %target, "Interrupting fetch because of {} usage limits", scope);
                self.wait_out(*backoff).await;
            }
            Outcome::ApiError(detail) => {
                error!(target = %target, "IQAir API interaction error: {}", detail);
            }
            Outcome::Fatal(detail) => {
                error!(target = %target, "Couldn't retrieve data from IQAir API: {}", detail);
            }
        }

        outcome.into_result()
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Registry constructor for `"iqair"` instances.
pub fn build(
    instance: &str,
    settings: &Map<String, Value>,
    sink: Arc<dyn MetricsSink>,
) -> Result<Box<dyn Adapter>> {
    let config = IqAirConfig::from_settings(settings)?;
    for key in config.ignored.keys() {
        warn!(adapter = instance, key = %key, "Ignoring unknown configuration parameter");
    }
    if config.targets.is_empty() {
        warn!(adapter = instance, "No targets configured, polling cycles will be empty");
    }

    let client = IqAirClient::new(&config, Arc::clone(&sink))?;
    info!(
        adapter = instance,
        endpoint = %client.endpoint(),
        targets = config.targets.len(),
        "🔑 IQAir adapter configured"
    );

    let poller = Poller::new(instance, client, config.targets.clone(), config.poller_settings(), sink);
    Ok(Box::new(poller))
}
