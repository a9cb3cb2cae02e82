//! Provider adapter seam — provider-agnostic types and traits.
//!
//! Any telemetry provider implements [`TargetFetcher`]. The poller drives
//! fetchers; fetchers never see other fetchers. Adding a provider means
//! implementing the trait in a new module, then adding its constructor to
//! [`registry`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ExporterConfig;
use crate::metrics::MetricsSink;
use crate::poller::PollerHandle;
use crate::quota::WindowKind;

pub mod iqair;

// ── Core Types ──────────────────────────────────────────────────────

/// What ran out: one of our own tracked windows, or the provider itself
/// (an HTTP 429).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Window(WindowKind),
    Provider,
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Window(kind) => write!(f, "{} window", kind),
            Self::Provider => f.write_str("provider"),
        }
    }
}

/// Classified result of one fetch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    /// Expected backpressure. Retried.
    QuotaExceeded { scope: QuotaScope, backoff: Duration },
    /// Provider or response-level failure. Terminal for the attempt.
    ApiError(String),
    /// Anything unexpected. Retried.
    Fatal(String),
}

impl Outcome {
    /// Split into terminal outcomes (`Ok`) and retryable failures (`Err`).
    pub fn into_result(self) -> Result<Outcome, FetchError> {
        match self {
            Self::QuotaExceeded { scope, backoff } => Err(FetchError::QuotaExceeded { scope, backoff }),
            Self::Fatal(detail) => Err(FetchError::Fatal(detail)),
            terminal => Ok(terminal),
        }
    }

    /// `reason` label for the adapter error counter.
    pub fn error_reason(&self) -> Option<&'static str> {
        match self {
            Self::Success => None,
            Self::QuotaExceeded { .. } => Some("limit"),
            Self::ApiError(_) => Some("api_error"),
            Self::Fatal(_) => Some("unhandled"),
        }
    }
}

/// The retryable subset of [`Outcome`]; the only errors the retry
/// executor ever sees.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("usage limits hit on {scope} (backoff {}s)", .backoff.as_secs())]
    QuotaExceeded { scope: QuotaScope, backoff: Duration },
    #[error("{0}")]
    Fatal(String),
}

/// A poll subject. Immutable once the adapter is built.
pub trait PollTarget: fmt::Display + Send + Sync {
    /// Label pairs identifying the target on published metrics.
    fn labels(&self) -> Vec<(&'static str, &str)>;
}

// ── Fetcher Trait ───────────────────────────────────────────────────

/// One provider's fetch client.
///
/// `fetch` must absorb terminal failures (returning `Ok(Outcome::ApiError)`)
/// and surface only retryable ones as `Err`.
#[async_trait]
pub trait TargetFetcher: Send {
    type Target: PollTarget;

    /// Unique provider identifier (e.g., "iqair").
    fn provider_id(&self) -> &str;

    /// Prefix for the adapter's own bookkeeping metrics.
    fn metric_prefix(&self) -> &str;

    async fn fetch(&mut self, target: &Self::Target) -> Result<Outcome, FetchError>;
}

/// A configured, not yet running adapter instance.
pub trait Adapter: Send {
    fn name(&self) -> &str;

    fn provider_id(&self) -> &str;

    /// Start polling on its own task.
    fn spawn(self: Box<Self>) -> PollerHandle;
}

// ── Registry ────────────────────────────────────────────────────────

/// Builds an adapter from its instance name and raw settings.
pub type AdapterFactory =
    fn(&str, &Map<String, Value>, Arc<dyn MetricsSink>) -> Result<Box<dyn Adapter>>;

/// Static provider registry: provider id → constructor.
pub fn registry() -> HashMap<&'static str, AdapterFactory> {
    let mut map: HashMap<&'static str, AdapterFactory> = HashMap::new();
    map.insert(iqair::PROVIDER_ID, iqair::build);
    map
}

/// Build every adapter in the config, in instance-name order.
pub fn build_all(
    config: &ExporterConfig,
    sink: Arc<dyn MetricsSink>,
) -> Result<Vec<Box<dyn Adapter>>> {
    let registry = registry();

    config
        .providers
        .iter()
        .map(|(instance, entry)| {
            let provider = entry.provider_id(instance);
            let factory = registry.get(provider).with_context(|| {
                let mut known: Vec<_> = registry.keys().copied().collect();
                known.sort_unstable();
                format!(
                    "Unknown provider '{}' for instance '{}' (known: {})",
                    provider,
                    instance,
                    known.join(", ")
                )
            })?;

            factory(instance, &entry.settings, Arc::clone(&sink))
                .with_context(|| format!("Failed to configure provider instance '{}'", instance))
        })
        .collect()
}
