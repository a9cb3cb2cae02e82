//! Polling scheduler — runs one adapter's fetch cycle forever.
//!
//! Each cycle walks the target list in order, one target at a time, with
//! every fetch wrapped in the retry policy. A target that exhausts its
//! retries is logged and counted, and the cycle moves on. Between cycles
//! the poller sleeps for the polling interval.
//!
//! Stopping is cooperative: the flag is only read at the top of a cycle,
//! so an in-flight cycle or sleep always runs to completion.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{Adapter, FetchError, Outcome, PollTarget, TargetFetcher};
use crate::metrics::{MetricKind, MetricsSink};
use crate::retry::{Attempt, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub interval: Duration,
    pub retry: RetryPolicy,
}

/// Per-cycle tally, mostly for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// One fetch of one target, as seen by the retry executor.
struct TargetAttempt<'a, F: TargetFetcher> {
    fetcher: &'a mut F,
    target: &'a F::Target,
}

#[async_trait]
impl<'a, F: TargetFetcher> Attempt for TargetAttempt<'a, F> {
    type Output = Outcome;
    type Error = FetchError;

    async fn attempt(&mut self) -> Result<Outcome, FetchError> {
        self.fetcher.fetch(self.target).await
    }
}

pub struct Poller<F: TargetFetcher> {
    name: String,
    fetcher: F,
    targets: Vec<F::Target>,
    settings: PollerSettings,
    sink: Arc<dyn MetricsSink>,
    running: Arc<AtomicBool>,
}

impl<F: TargetFetcher> Poller<F> {
    pub fn new(
        name: impl Into<String>,
        fetcher: F,
        targets: Vec<F::Target>,
        settings: PollerSettings,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let poller = Self {
            name: name.into(),
            fetcher,
            targets,
            settings,
            sink,
            running: Arc::new(AtomicBool::new(false)),
        };
        poller.sink.init(
            &poller.results_metric(),
            MetricKind::Counter,
            "Adapter target fetching results",
        );
        poller
    }

    #[cfg(test)]
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    fn results_metric(&self) -> String {
        format!("{}_target_results", self.fetcher.metric_prefix())
    }

    /// Fetch every target once, in order.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let results_metric = self.results_metric();

        for target in &self.targets {
            let label = format!("{}:{}", self.name, target);
            let mut attempt = TargetAttempt {
                fetcher: &mut self.fetcher,
                target,
            };

            let succeeded = match self.settings.retry.execute(&label, &mut attempt).await {
                Ok(Outcome::Success) => true,
                Ok(outcome) => {
                    debug!(adapter = %self.name, target = %target, ?outcome, "Target fetch failed without retry");
                    false
                }
                Err(e) => {
                    error!(
                        adapter = %self.name,
                        target = %target,
                        "Giving up on target for this cycle: {}",
                        e
                    );
                    false
                }
            };

            let outcome = if succeeded { "success" } else { "failure" };
            let mut labels = vec![("outcome", outcome)];
            labels.extend(target.labels());
            self.sink.inc(&results_metric, 1.0, &labels);

            if succeeded {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    /// Cycle until the running flag is cleared.
    pub async fn run(mut self) {
        info!(
            adapter = %self.name,
            provider = self.fetcher.provider_id(),
            targets = self.targets.len(),
            interval_secs = self.settings.interval.as_secs(),
            "📡 Poller starting"
        );

        while self.running.load(Ordering::SeqCst) {
            let report = self.run_cycle().await;
            info!(
                adapter = %self.name,
                succeeded = report.succeeded,
                failed = report.failed,
                "Polling cycle complete"
            );

            debug!(
                adapter = %self.name,
                "Sleeping for {} sec until the next polling cycle",
                self.settings.interval.as_secs()
            );
            tokio::time::sleep(self.settings.interval).await;
        }

        info!(adapter = %self.name, "Poller stopped");
    }
}

impl<F> Poller<F>
where
    F: TargetFetcher + 'static,
    F::Target: 'static,
{
    /// Mark running and drive [`run`](Self::run) on its own task.
    pub fn spawn(self) -> PollerHandle {
        self.running.store(true, Ordering::SeqCst);
        let name = self.name.clone();
        let running = Arc::clone(&self.running);
        let task = tokio::spawn(self.run());
        PollerHandle { name, running, task }
    }
}

impl<F> Adapter for Poller<F>
where
    F: TargetFetcher + 'static,
    F::Target: 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_id(&self) -> &str {
        self.fetcher.provider_id()
    }

    fn spawn(self: Box<Self>) -> PollerHandle {
        Poller::spawn(*self)
    }
}

/// Control handle for a spawned poller.
pub struct PollerHandle {
    name: String,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request a stop. Observed at the start of the next cycle.
    pub fn stop(&self) {
        warn!(adapter = %self.name, "Stopping the poller");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the poller task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(adapter = %self.name, "Poller task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::QuotaScope;
    use crate::metrics::PrometheusSink;
    use std::collections::{HashMap, VecDeque};
    use std::fmt;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone)]
    struct Spot(&'static str);

    impl fmt::Display for Spot {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl PollTarget for Spot {
        fn labels(&self) -> Vec<(&'static str, &str)> {
            vec![("city", self.0)]
        }
    }

    /// Plays back scripted outcomes per target; defaults to success.
    struct Scripted {
        script: HashMap<&'static str, VecDeque<Outcome>>,
        calls: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(script: Vec<(&'static str, Vec<Outcome>)>) -> Self {
            Self {
                script: script.into_iter().map(|(k, v)| (k, v.into())).collect(),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl TargetFetcher for Scripted {
        type Target = Spot;

        fn provider_id(&self) -> &str {
            "scripted"
        }

        fn metric_prefix(&self) -> &str {
            "test"
        }

        async fn fetch(&mut self, target: &Spot) -> Result<Outcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .get_mut(target.0)
                .and_then(|q| q.pop_front())
                .unwrap_or(Outcome::Success);
            next.into_result()
        }
    }

    fn settings(max_attempts: u32) -> PollerSettings {
        PollerSettings {
            interval: Duration::from_secs(60),
            retry: RetryPolicy::bounded(max_attempts),
        }
    }

    fn poller(script: Scripted, targets: Vec<Spot>, sink: &Arc<PrometheusSink>) -> Poller<Scripted> {
        let shared: Arc<dyn MetricsSink> = sink.clone();
        Poller::new("test", script, targets, settings(3), shared)
    }

    fn results(sink: &PrometheusSink, outcome: &str, city: &str) -> Option<f64> {
        sink.sample("test_target_results", &[("outcome", outcome), ("city", city)])
    }

    #[tokio::test]
    async fn test_api_error_is_not_retried_and_cycle_continues() {
        let sink = Arc::new(PrometheusSink::new());
        let script = Scripted::new(vec![("a", vec![Outcome::ApiError("city_not_found".into())])]);
        let calls = Arc::clone(&script.calls);
        let mut p = poller(script, vec![Spot("a"), Spot("b")], &sink);

        let report = p.run_cycle().await;

        assert_eq!(report, CycleReport { succeeded: 1, failed: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(results(&sink, "failure", "a"), Some(1.0));
        assert_eq!(results(&sink, "success", "b"), Some(1.0));
    }

    #[tokio::test]
    async fn test_retryable_failures_then_success() {
        let sink = Arc::new(PrometheusSink::new());
        let quota = Outcome::QuotaExceeded {
            scope: QuotaScope::Provider,
            backoff: Duration::ZERO,
        };
        let script = Scripted::new(vec![("a", vec![quota, Outcome::Fatal("reset".into())])]);
        let calls = Arc::clone(&script.calls);
        let mut p = poller(script, vec![Spot("a")], &sink);

        let report = p.run_cycle().await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_do_not_stop_the_cycle() {
        let sink = Arc::new(PrometheusSink::new());
        let fatal = || Outcome::Fatal("connection refused".into());
        let script = Scripted::new(vec![("a", vec![fatal(), fatal(), fatal(), fatal()])]);
        let calls = Arc::clone(&script.calls);
        let mut p = poller(script, vec![Spot("a"), Spot("b")], &sink);

        let report = p.run_cycle().await;

        assert_eq!(report, CycleReport { succeeded: 1, failed: 1 });
        // 3 attempts on "a", 1 on "b"
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(results(&sink, "failure", "a"), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_observed_after_the_running_cycle() {
        let sink = Arc::new(PrometheusSink::new());
        let script = Scripted::new(vec![]);
        let calls = Arc::clone(&script.calls);
        let handle = poller(script, vec![Spot("a"), Spot("b")], &sink).spawn();
        assert!(handle.is_running());

        while results(&sink, "success", "b").is_none() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle.stop();
        handle.join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_repeat_after_interval() {
        let sink = Arc::new(PrometheusSink::new());
        let script = Scripted::new(vec![]);
        let handle = poller(script, vec![Spot("a")], &sink).spawn();

        tokio::time::sleep(Duration::from_secs(150)).await;
        handle.stop();
        handle.join().await;

        // t=0, t=60, t=120
        assert_eq!(results(&sink, "success", "a"), Some(3.0));
    }
}
