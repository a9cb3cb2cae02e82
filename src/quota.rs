//! Quota tracker — pre-flight request accounting against a provider's
//! per-minute / per-day (and optionally per-month) allowances.
//!
//! Each window keeps a running request-count threshold and the instant it
//! was last re-based. A window rolls over when the clock enters a new
//! minute / calendar day / calendar month; at that point its threshold is
//! moved to `total_requests + limit`. The adapter checks this BEFORE every
//! remote call to avoid wasting a request that would 429.
//!
//! Owned by exactly one adapter task, so there is no locking here.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{Datelike, Days, Local, Months, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use tracing::{debug, warn};

/// Source of "now" for window evaluation.
pub type Clock = fn() -> NaiveDateTime;

/// Local wall-clock time, the default [`Clock`].
pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

// ── Windows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WindowKind {
    Minute,
    Day,
    Month,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// Start of the window unit containing `t`.
    fn truncate(self, t: NaiveDateTime) -> NaiveDateTime {
        let midnight = t.date().and_time(NaiveTime::MIN);
        match self {
            Self::Minute => midnight + TimeDelta::minutes(i64::from(t.hour() * 60 + t.minute())),
            Self::Day => midnight,
            Self::Month => (t.date() - Days::new(u64::from(t.day0()))).and_time(NaiveTime::MIN),
        }
    }

    /// Start of the window unit following the one containing `t`.
    fn next_boundary(self, t: NaiveDateTime) -> NaiveDateTime {
        let start = self.truncate(t);
        match self {
            Self::Minute => start + TimeDelta::minutes(1),
            Self::Day => start + TimeDelta::days(1),
            Self::Month => start
                .checked_add_months(Months::new(1))
                .unwrap_or(start + TimeDelta::days(31)),
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold + last re-base instant for one window kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaWindow {
    /// Running request count at which the window is exhausted.
    pub threshold: u64,
    /// When the window was last re-based. Only ever moves forward.
    pub boundary: NaiveDateTime,
}

/// Configured per-window request allowances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub minute: u64,
    pub day: u64,
    pub month: u64,
}

impl QuotaLimits {
    fn for_kind(&self, kind: WindowKind) -> u64 {
        match kind {
            WindowKind::Minute => self.minute,
            WindowKind::Day => self.day,
            WindowKind::Month => self.month,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsageState {
    /// Requests issued over the adapter's lifetime. Never decreases.
    pub total_requests: u64,
    pub windows: BTreeMap<WindowKind, QuotaWindow>,
}

/// Result of a single window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny { backoff: Duration },
}

/// A failed pre-flight check: which window is exhausted and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDenial {
    pub window: WindowKind,
    pub backoff: Duration,
}

// ── Public API ──────────────────────────────────────────────────────

pub struct QuotaTracker {
    usage: UsageState,
    limits: QuotaLimits,
    enforce_month: bool,
    clock: Clock,
}

impl QuotaTracker {
    pub fn new(limits: QuotaLimits) -> Self {
        Self::with_clock(limits, local_now)
    }

    pub fn with_clock(limits: QuotaLimits, clock: Clock) -> Self {
        let now = clock();
        let windows = [WindowKind::Minute, WindowKind::Day, WindowKind::Month]
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    QuotaWindow {
                        threshold: limits.for_kind(kind),
                        boundary: now,
                    },
                )
            })
            .collect();

        Self {
            usage: UsageState {
                total_requests: 0,
                windows,
            },
            limits,
            enforce_month: false,
            clock,
        }
    }

    /// Also evaluate the month window in [`check_limits`](Self::check_limits).
    /// Off by default: the month allowance is tracked but not enforced.
    pub fn enforce_month(mut self, enforce: bool) -> Self {
        self.enforce_month = enforce;
        self
    }

    #[cfg(test)]
    pub fn usage(&self) -> &UsageState {
        &self.usage
    }

    #[cfg(test)]
    pub fn total_requests(&self) -> u64 {
        self.usage.total_requests
    }

    #[cfg(test)]
    pub fn window(&self, kind: WindowKind) -> Option<&QuotaWindow> {
        self.usage.windows.get(&kind)
    }

    /// Record that a request went out. Returns the new total.
    pub fn record_request(&mut self) -> u64 {
        self.usage.total_requests += 1;
        self.usage.total_requests
    }

    /// Evaluate one window at `now`. Re-bases the window if its unit has
    /// rolled over; otherwise never mutates state.
    pub fn check_window(&mut self, kind: WindowKind, now: NaiveDateTime) -> Verdict {
        let total = self.usage.total_requests;
        let limit = self.limits.for_kind(kind);
        let Some(window) = self.usage.windows.get_mut(&kind) else {
            return Verdict::Allow;
        };

        let count_reached = total >= window.threshold;
        let expired = kind.truncate(now) > kind.truncate(window.boundary);
        debug!(
            window = %kind,
            total_requests = total,
            threshold = window.threshold,
            count_reached,
            expired,
            "Usage limit validation"
        );

        if expired {
            debug!(window = %kind, "Usage window rolled over, re-basing threshold");
            window.threshold = total + limit;
            window.boundary = now;
            return Verdict::Allow;
        }

        if !count_reached {
            return Verdict::Allow;
        }

        let next = kind.next_boundary(window.boundary);
        let backoff = (next - now).to_std().unwrap_or(Duration::ZERO);
        warn!(
            window = %kind,
            total_requests = total,
            threshold = window.threshold,
            next_boundary = %next,
            backoff_secs = backoff.as_secs(),
            "API request limit reached"
        );
        Verdict::Deny { backoff }
    }

    /// Pre-flight check at the tracker's clock.
    pub fn check_limits(&mut self) -> Result<(), QuotaDenial> {
        let now = (self.clock)();
        self.check_limits_at(now)
    }

    /// Coarse windows first: (month,) day, then minute. The first denial
    /// wins, so a day-level exhaustion is reported even if the minute
    /// window is also exhausted.
    pub fn check_limits_at(&mut self, now: NaiveDateTime) -> Result<(), QuotaDenial> {
        let order: &[WindowKind] = if self.enforce_month {
            &[WindowKind::Month, WindowKind::Day, WindowKind::Minute]
        } else {
            &[WindowKind::Day, WindowKind::Minute]
        };

        for &kind in order {
            if let Verdict::Deny { backoff } = self.check_window(kind, now) {
                return Err(QuotaDenial { window: kind, backoff });
            }
        }

        debug!(total_requests = self.usage.total_requests, "API usage limits are OK");
        Ok(())
    }
}
