//! Process-wide metrics sink.
//!
//! Adapters only see the [`MetricsSink`] trait: declare a family once,
//! then `set` gauges / `inc` counters by name with a label set. The
//! Prometheus-backed implementation creates the underlying vector lazily,
//! fixing the family's label names on the first sample written to it.
//!
//! Writes never fail from the caller's point of view. A bad label set or
//! a kind mismatch is logged and the sample is dropped.

use anyhow::{Context, Result};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Content type of the Prometheus text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// Shared sink for published readings and adapter bookkeeping.
/// Must tolerate concurrent calls from every adapter task.
pub trait MetricsSink: Send + Sync {
    /// Declare a family. Re-declaring with the same kind is a no-op.
    fn init(&self, name: &str, kind: MetricKind, help: &str);

    /// Set a gauge sample.
    fn set(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Add `delta` to a counter (or gauge) sample.
    fn inc(&self, name: &str, delta: f64, labels: &[(&str, &str)]);
}

enum Family {
    /// Declared, no sample written yet: label names still open.
    Declared { kind: MetricKind, help: String },
    Gauge(GaugeVec),
    Counter(CounterVec),
}

impl Family {
    fn kind(&self) -> MetricKind {
        match self {
            Self::Declared { kind, .. } => *kind,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Counter(_) => MetricKind::Counter,
        }
    }
}

pub struct PrometheusSink {
    registry: Registry,
    families: Mutex<HashMap<String, Family>>,
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusSink {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            families: Mutex::new(HashMap::new()),
        }
    }

    fn families(&self) -> MutexGuard<'_, HashMap<String, Family>> {
        self.families.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Turn a declared family into a registered vector using the label
    /// names of the first sample. Undeclared names are auto-declared.
    fn materialize<'a>(
        &self,
        families: &'a mut HashMap<String, Family>,
        name: &str,
        kind: MetricKind,
        labels: &[(&str, &str)],
    ) -> Option<&'a Family> {
        let family = families.entry(name.to_string()).or_insert_with(|| {
            debug!(metric = name, "Metric used before init, declaring with default help");
            Family::Declared {
                kind,
                help: name.to_string(),
            }
        });

        let declared = match &*family {
            Family::Declared { kind, help } => Some((*kind, help.clone())),
            _ => None,
        };

        if let Some((kind, help)) = declared {
            let opts = Opts::new(name, help);
            let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();

            let built = match kind {
                MetricKind::Gauge => GaugeVec::new(opts, &label_names).and_then(|vec| {
                    self.registry.register(Box::new(vec.clone()))?;
                    Ok(Family::Gauge(vec))
                }),
                MetricKind::Counter => CounterVec::new(opts, &label_names).and_then(|vec| {
                    self.registry.register(Box::new(vec.clone()))?;
                    Ok(Family::Counter(vec))
                }),
            };

            match built {
                Ok(registered) => *family = registered,
                Err(e) => {
                    warn!(metric = name, "Failed to register metric: {}", e);
                    return None;
                }
            }
        }

        Some(&*family)
    }

    /// Render every family in the text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Encoded metrics are not valid UTF-8")
    }

    /// Current value of the sample with exactly this label set, if it has
    /// been written.
    #[cfg(test)]
    pub fn sample(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let families = self.registry.gather();
        let family = families.iter().find(|f| f.get_name() == name)?;

        family
            .get_metric()
            .iter()
            .find(|m| {
                let pairs = m.get_label();
                pairs.len() == labels.len()
                    && labels.iter().all(|(k, v)| {
                        pairs.iter().any(|p| p.get_name() == *k && p.get_value() == *v)
                    })
            })
            .map(|m| match family.get_field_type() {
                prometheus::proto::MetricType::COUNTER => m.get_counter().get_value(),
                _ => m.get_gauge().get_value(),
            })
    }
}

fn label_map<'a>(labels: &[(&'a str, &'a str)]) -> HashMap<&'a str, &'a str> {
    labels.iter().copied().collect()
}

impl MetricsSink for PrometheusSink {
    fn init(&self, name: &str, kind: MetricKind, help: &str) {
        let mut families = self.families();
        match families.get(name) {
            Some(existing) if existing.kind() != kind => {
                warn!(metric = name, "Metric already declared with a different kind");
            }
            Some(_) => {}
            None => {
                families.insert(
                    name.to_string(),
                    Family::Declared {
                        kind,
                        help: help.to_string(),
                    },
                );
            }
        }
    }

    fn set(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let mut families = self.families();
        match self.materialize(&mut families, name, MetricKind::Gauge, labels) {
            Some(Family::Gauge(vec)) => match vec.get_metric_with(&label_map(labels)) {
                Ok(gauge) => gauge.set(value),
                Err(e) => warn!(metric = name, "Dropping gauge sample: {}", e),
            },
            Some(Family::Counter(_)) => {
                warn!(metric = name, "set() called on a counter, dropping sample");
            }
            _ => {}
        }
    }

    fn inc(&self, name: &str, delta: f64, labels: &[(&str, &str)]) {
        let mut families = self.families();
        match self.materialize(&mut families, name, MetricKind::Counter, labels) {
            Some(Family::Counter(vec)) => {
                if delta < 0.0 {
                    warn!(metric = name, delta, "Counters cannot decrease, dropping sample");
                    return;
                }
                match vec.get_metric_with(&label_map(labels)) {
                    Ok(counter) => counter.inc_by(delta),
                    Err(e) => warn!(metric = name, "Dropping counter sample: {}", e),
                }
            }
            Some(Family::Gauge(vec)) => match vec.get_metric_with(&label_map(labels)) {
                Ok(gauge) => gauge.add(delta),
                Err(e) => warn!(metric = name, "Dropping gauge sample: {}", e),
            },
            _ => {}
        }
    }
}
