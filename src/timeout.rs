//! Timers with retry budgets.
//!
//! A [`Timeout`] is a pure state machine: it only reads the clock. The boot
//! loop uses the fixed slots of [`Timeouts`] (overall deadline, boot cycle,
//! console inactivity, ...) and user watchdogs share the same engine through
//! the named watchdog map.
//!
//! # Job Document Format
//!
//! ```yaml
//! timeouts:
//!   overall:
//!     hours: 1
//!   boot_cycle:
//!     minutes: 10
//!     retries: 2
//!   console_activity:
//!     minutes: 2
//!     retries: 1
//!   watchdogs:
//!     piglit:
//!       minutes: 5
//! ```
//!
//! Slots left out of the document never expire.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Result type for timeout configuration.
pub type TimeoutResult<T> = Result<T, TimeoutError>;

/// Errors raised while building [`Timeouts`] from a job document.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TimeoutError {
    /// A timeout that acts as a single hard deadline was given retries.
    #[error("The '{name}' timeout cannot be retried (got {retries} retries)")]
    NotRetryable { name: String, retries: u32 },

    /// A duration component was negative or not a finite number.
    #[error("Invalid duration for timeout '{name}': {reason}")]
    InvalidDuration { name: String, reason: String },
}

/// A named timer with a retry budget.
///
/// The timer is inert until [`start`](Self::start) is called. Once started it
/// expires when strictly more than `duration` has elapsed.
#[derive(Debug, Clone)]
pub struct Timeout {
    name: String,
    duration: Duration,
    max_retries: u32,
    started_at: Option<Instant>,
    retried: u32,
}

impl Timeout {
    /// Creates a stopped timeout.
    pub fn new(name: impl Into<String>, duration: Duration, max_retries: u32) -> Self {
        Self {
            name: name.into(),
            duration,
            max_retries,
            started_at: None,
            retried: 0,
        }
    }

    /// Creates a timeout that never expires and has no retries.
    pub fn infinite(name: impl Into<String>) -> Self {
        Self::new(name, Duration::MAX, 0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Number of times [`retry`](Self::retry) has been called.
    pub fn retried(&self) -> u32 {
        self.retried
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_infinite(&self) -> bool {
        self.duration == Duration::MAX
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, when: Instant) {
        self.started_at = Some(when);
    }

    /// Restarts the timer from `when` (or now), keeping the retry count.
    pub fn reset(&mut self, when: Option<Instant>) {
        self.started_at = Some(when.unwrap_or_else(Instant::now));
    }

    /// Stops the timer. Stopping a stopped timer is a no-op.
    pub fn stop(&mut self) {
        self.started_at = None;
    }

    /// Stops the timer and consumes one retry.
    ///
    /// Returns `false` once the retry budget is exceeded.
    pub fn retry(&mut self) -> bool {
        self.stop();
        self.retried += 1;
        self.retried <= self.max_retries
    }

    /// How long the timer has been running at `now`.
    pub fn active_for_at(&self, now: Instant) -> Option<Duration> {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Instant::now())
    }

    pub fn has_expired_at(&self, now: Instant) -> bool {
        match self.active_for_at(now) {
            Some(active) => !self.is_infinite() && active > self.duration,
            None => false,
        }
    }

    /// The instant right after which the timer expires, if it is running.
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_infinite() {
            return None;
        }
        self.started_at
            .and_then(|started| started.checked_add(self.duration))
    }

    /// Shortens the duration so that the timer cannot outlive `limit`.
    pub fn clamp_duration(&mut self, limit: Duration) {
        self.duration = self.duration.min(limit);
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "<Timeout {}: infinite>", self.name)
        } else {
            write!(
                f,
                "<Timeout {}: value={:?}, retries={}/{}>",
                self.name, self.duration, self.retried, self.max_retries
            )
        }
    }
}

/// The fixed timeout slots every job has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeoutKind {
    Overall,
    InfraSetup,
    InfraTeardown,
    BootCycle,
    ConsoleActivity,
    FirstConsoleActivity,
}

impl TimeoutKind {
    pub const ALL: [TimeoutKind; 6] = [
        TimeoutKind::Overall,
        TimeoutKind::InfraSetup,
        TimeoutKind::InfraTeardown,
        TimeoutKind::BootCycle,
        TimeoutKind::ConsoleActivity,
        TimeoutKind::FirstConsoleActivity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::Overall => "overall",
            TimeoutKind::InfraSetup => "infra_setup",
            TimeoutKind::InfraTeardown => "infra_teardown",
            TimeoutKind::BootCycle => "boot_cycle",
            TimeoutKind::ConsoleActivity => "console_activity",
            TimeoutKind::FirstConsoleActivity => "first_console_activity",
        }
    }

    /// Single deadlines that must not be given retries.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TimeoutKind::Overall | TimeoutKind::InfraTeardown)
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timeout entry of a job document.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSpec {
    #[serde(default)]
    pub days: f64,
    #[serde(default)]
    pub hours: f64,
    #[serde(default)]
    pub minutes: f64,
    #[serde(default)]
    pub seconds: f64,
    #[serde(default)]
    pub milliseconds: f64,
    #[serde(default)]
    pub retries: u32,
}

impl TimeoutSpec {
    /// Total duration described by the entry.
    pub fn duration(&self, name: &str) -> TimeoutResult<Duration> {
        let parts = [
            ("days", self.days, 86_400.0),
            ("hours", self.hours, 3_600.0),
            ("minutes", self.minutes, 60.0),
            ("seconds", self.seconds, 1.0),
            ("milliseconds", self.milliseconds, 0.001),
        ];

        let mut total = 0.0;
        for (field, value, scale) in parts {
            if !value.is_finite() || value < 0.0 {
                return Err(TimeoutError::InvalidDuration {
                    name: name.to_string(),
                    reason: format!("{} must be a positive number, got {}", field, value),
                });
            }
            total += value * scale;
        }

        Duration::try_from_secs_f64(total).map_err(|e| TimeoutError::InvalidDuration {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn build(&self, name: &str) -> TimeoutResult<Timeout> {
        Ok(Timeout::new(name, self.duration(name)?, self.retries))
    }
}

/// The `timeouts` section of a job document.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub overall: Option<TimeoutSpec>,
    pub infra_setup: Option<TimeoutSpec>,
    pub infra_teardown: Option<TimeoutSpec>,
    pub boot_cycle: Option<TimeoutSpec>,
    pub console_activity: Option<TimeoutSpec>,
    pub first_console_activity: Option<TimeoutSpec>,
    #[serde(default)]
    pub watchdogs: BTreeMap<String, TimeoutSpec>,
}

impl TimeoutsConfig {
    fn slot(&self, kind: TimeoutKind) -> Option<&TimeoutSpec> {
        match kind {
            TimeoutKind::Overall => self.overall.as_ref(),
            TimeoutKind::InfraSetup => self.infra_setup.as_ref(),
            TimeoutKind::InfraTeardown => self.infra_teardown.as_ref(),
            TimeoutKind::BootCycle => self.boot_cycle.as_ref(),
            TimeoutKind::ConsoleActivity => self.console_activity.as_ref(),
            TimeoutKind::FirstConsoleActivity => self.first_console_activity.as_ref(),
        }
    }
}

/// Outcome of [`Timeouts::retry_expired_at`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryVerdict {
    /// Names of the timeouts that had expired.
    pub expired: Vec<String>,
    /// Names of the expired timeouts whose retry budget is exhausted.
    pub exhausted: Vec<String>,
}

impl RetryVerdict {
    pub fn should_abort(&self) -> bool {
        !self.exhausted.is_empty()
    }
}

/// The complete set of timeouts of a job.
#[derive(Debug, Clone)]
pub struct Timeouts {
    fixed: [Timeout; 6],
    watchdogs: BTreeMap<String, Timeout>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fixed: TimeoutKind::ALL.map(|kind| Timeout::infinite(kind.as_str())),
            watchdogs: BTreeMap::new(),
        }
    }
}

impl Timeouts {
    /// Builds and validates the timeouts described by a job document.
    pub fn from_config(config: &TimeoutsConfig) -> TimeoutResult<Self> {
        let mut timeouts = Self::default();

        for kind in TimeoutKind::ALL {
            if let Some(spec) = config.slot(kind) {
                timeouts.set(kind, spec.build(kind.as_str())?)?;
            }
        }

        for (name, spec) in &config.watchdogs {
            timeouts.add_watchdog(spec.build(name)?);
        }

        Ok(timeouts)
    }

    /// Replaces a fixed slot, enforcing the no-retry rule.
    pub fn set(&mut self, kind: TimeoutKind, timeout: Timeout) -> TimeoutResult<()> {
        if !kind.is_retryable() && timeout.max_retries() > 0 {
            return Err(TimeoutError::NotRetryable {
                name: kind.as_str().to_string(),
                retries: timeout.max_retries(),
            });
        }
        self.fixed[kind as usize] = timeout;
        Ok(())
    }

    pub fn add_watchdog(&mut self, timeout: Timeout) {
        self.watchdogs.insert(timeout.name().to_string(), timeout);
    }

    pub fn get(&self, kind: TimeoutKind) -> &Timeout {
        &self.fixed[kind as usize]
    }

    pub fn get_mut(&mut self, kind: TimeoutKind) -> &mut Timeout {
        &mut self.fixed[kind as usize]
    }

    pub fn watchdog(&self, name: &str) -> Option<&Timeout> {
        self.watchdogs.get(name)
    }

    pub fn watchdog_mut(&mut self, name: &str) -> Option<&mut Timeout> {
        self.watchdogs.get_mut(name)
    }

    pub fn watchdog_names(&self) -> impl Iterator<Item = &str> {
        self.watchdogs.keys().map(String::as_str)
    }

    /// Fixed slots in declaration order, then watchdogs by name.
    pub fn iter(&self) -> impl Iterator<Item = &Timeout> {
        self.fixed.iter().chain(self.watchdogs.values())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Timeout> {
        self.fixed.iter_mut().chain(self.watchdogs.values_mut())
    }

    pub fn expired_list(&self) -> Vec<&Timeout> {
        self.expired_list_at(Instant::now())
    }

    pub fn expired_list_at(&self, now: Instant) -> Vec<&Timeout> {
        self.iter().filter(|t| t.has_expired_at(now)).collect()
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Instant::now())
    }

    pub fn has_expired_at(&self, now: Instant) -> bool {
        self.iter().any(|t| t.has_expired_at(now))
    }

    /// Earliest instant at which a running timer expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.iter().filter_map(Timeout::deadline).min()
    }

    /// Calls [`Timeout::retry`] on every timeout expired at `now`.
    pub fn retry_expired_at(&mut self, now: Instant) -> RetryVerdict {
        let mut verdict = RetryVerdict::default();
        for timeout in self.iter_mut() {
            if !timeout.has_expired_at(now) {
                continue;
            }
            verdict.expired.push(timeout.name().to_string());
            if !timeout.retry() {
                verdict.exhausted.push(timeout.name().to_string());
            }
        }
        verdict
    }

    /// Stops every timer except `overall`.
    pub fn stop_per_cycle(&mut self) {
        for timeout in self.iter_mut() {
            if timeout.name() != TimeoutKind::Overall.as_str() {
                timeout.stop();
            }
        }
    }

    /// Stops every timer.
    pub fn stop_all(&mut self) {
        for timeout in self.iter_mut() {
            timeout.stop();
        }
    }
}
