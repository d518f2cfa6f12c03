//! Poll-until-observed retrier
//!
//! Scenarios often trigger a backend update and then wait for it to show up in
//! the UI. Examples are a report run-count going up by one, a new
//! Cradle-to-Grave row, or a wallboard deletion. [`Retrier`] samples the
//! observable state until it satisfies an [`Expected`] value, or until the
//! configured [`PollBounds`] run out.
//!
//! ```text
//! sample ──► satisfied? ──yes──► PollReport { success: true, .. }
//!               │ no
//!               ▼
//!        bounds exhausted? ──yes──► PollReport { reason: Timeout, .. }
//!               │ no
//!               ▼
//!        sleep(interval) ─► recover() ─► sample ...
//! ```
//!
//! A sample that fails (element not rendered yet, request refused) counts as
//! "not yet satisfied". It is recorded separately from a value that was read
//! but did not match.

use std::convert::Infallible;
use std::fmt::{self, Debug, Display};
use std::future::{Future, Ready};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::yield_now;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default number of samples when only an attempt bound is wanted
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default pause between samples
pub const DEFAULT_INTERVAL_MS: u64 = 1_000;

/// Attempts kept in [`PollReport::history`]; older ones are only counted
pub const MAX_HISTORY: usize = 50;

/// Limits on a poll loop. At least one of `max_attempts` or `timeout` is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollBounds {
    max_attempts: Option<u32>,
    timeout: Option<Duration>,
    interval: Duration,
    backoff: f64,
    max_interval: Duration,
}

impl PollBounds {
    /// Create bounds, rejecting loops that could run forever
    pub fn new(max_attempts: Option<u32>, timeout: Option<Duration>, interval: Duration) -> Result<Self> {
        if max_attempts.is_none() && timeout.is_none() {
            return Err(Error::InvalidBounds(
                "either max_attempts or timeout must be set".to_string(),
            ));
        }
        if max_attempts == Some(0) {
            return Err(Error::InvalidBounds("max_attempts must be at least 1".to_string()));
        }

        Ok(Self {
            max_attempts,
            timeout,
            interval,
            backoff: 1.0,
            max_interval: interval,
        })
    }

    /// Bound by number of samples only
    pub fn attempts(max_attempts: u32, interval: Duration) -> Result<Self> {
        Self::new(Some(max_attempts), None, interval)
    }

    /// Bound by wall-clock time only
    pub fn deadline(timeout: Duration, interval: Duration) -> Result<Self> {
        Self::new(None, Some(timeout), interval)
    }

    /// Grow the pause geometrically by `factor` after each failed sample, capped at `max_interval`
    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Result<Self> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(Error::InvalidBounds(format!(
                "backoff factor must be a finite number >= 1.0, got {}",
                factor
            )));
        }
        if max_interval < self.interval {
            return Err(Error::InvalidBounds(format!(
                "max_interval ({:?}) is shorter than interval ({:?})",
                max_interval, self.interval
            )));
        }
        self.backoff = factor;
        self.max_interval = max_interval;
        Ok(self)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Pause that follows the given (1-based) failed attempt
    pub fn interval_for(&self, attempt: u32) -> Duration {
        if self.backoff <= 1.0 || attempt <= 1 {
            return self.interval;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.interval.as_secs_f64() * self.backoff.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_interval.as_secs_f64()))
    }
}

impl Default for PollBounds {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            timeout: None,
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            backoff: 1.0,
            max_interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
        }
    }
}

type Check<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Condition a sampled value must meet
#[derive(Clone)]
pub enum Expected<T> {
    /// The value equals this target
    Exact(T),
    /// The value passes a named check
    Satisfies { description: String, check: Check<T> },
}

impl<T> Expected<T> {
    pub fn satisfies<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Expected::Satisfies {
            description: description.into(),
            check: Arc::new(check),
        }
    }
}

impl<T: PartialEq + Display> Expected<T> {
    pub fn is_satisfied_by(&self, value: &T) -> bool {
        match self {
            Expected::Exact(target) => value == target,
            Expected::Satisfies { check, .. } => check(value),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Expected::Exact(target) => format!("value == {}", target),
            Expected::Satisfies { description, .. } => description.clone(),
        }
    }
}

impl Expected<i64> {
    /// `baseline + 1`, the usual run-count expectation
    pub fn increment_of(baseline: i64) -> Self {
        Self::delta(baseline, 1)
    }

    pub fn delta(baseline: i64, delta: i64) -> Self {
        Expected::Exact(baseline.saturating_add(delta))
    }

    pub fn at_least(minimum: i64) -> Self {
        Self::satisfies(format!("value >= {}", minimum), move |v: &i64| *v >= minimum)
    }
}

impl Expected<String> {
    pub fn text(text: impl Into<String>) -> Self {
        Expected::Exact(text.into())
    }

    pub fn contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        let description = format!("text contains {:?}", needle);
        Self::satisfies(description, move |v: &String| v.contains(needle.as_str()))
    }

    pub fn not_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        let description = format!("text does not contain {:?}", needle);
        Self::satisfies(description, move |v: &String| !v.contains(needle.as_str()))
    }
}

impl<T: Debug> Debug for Expected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Exact(target) => f.debug_tuple("Exact").field(target).finish(),
            Expected::Satisfies { description, .. } => f
                .debug_struct("Satisfies")
                .field("description", description)
                .finish_non_exhaustive(),
        }
    }
}

/// What a single sample saw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation<T> {
    Matched { value: T },
    Mismatched { value: T },
    ReadError { message: String },
}

/// One sample in a poll loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollAttempt<T> {
    pub number: u32,
    pub elapsed_ms: u64,
    pub observation: Observation<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Bounds ran out before the expectation held
    Timeout,
    /// A value was read but it was wrong
    Mismatch,
    /// The single read failed
    ReadError,
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Mismatch => "mismatch",
            FailureReason::ReadError => "read_error",
        };
        f.write_str(s)
    }
}

/// Outcome of a poll loop, with enough detail to debug a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollReport<T> {
    pub success: bool,
    /// Matched value on success, otherwise the last value that was read
    pub value: Option<T>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub reason: Option<FailureReason>,
    pub expected: String,
    pub mismatches: u32,
    pub read_errors: u32,
    pub recovery_errors: u32,
    pub last_error: Option<String>,
    /// Most recent attempts, at most [`MAX_HISTORY`]
    pub history: Vec<PollAttempt<T>>,
    /// Attempts evicted from `history`
    #[serde(default)]
    pub history_dropped: u32,
}

impl<T: Clone> PollReport<T> {
    fn started(expected: String) -> Self {
        Self {
            success: false,
            value: None,
            attempts: 0,
            elapsed_ms: 0,
            reason: None,
            expected,
            mismatches: 0,
            read_errors: 0,
            recovery_errors: 0,
            last_error: None,
            history: Vec::new(),
            history_dropped: 0,
        }
    }

    fn push_history(&mut self, attempt: PollAttempt<T>) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
            self.history_dropped = self.history_dropped.saturating_add(u32::try_from(excess).unwrap_or(u32::MAX));
        }
        self.history.push(attempt);
    }

    /// Fold in one extra single-shot sample taken after this poll gave up.
    /// The sample is numbered as the next attempt.
    pub fn append_final(&mut self, last: PollReport<T>) {
        let number = self.attempts + 1;
        self.attempts = number;
        self.elapsed_ms = self.elapsed_ms.saturating_add(last.elapsed_ms);
        self.mismatches += last.mismatches;
        self.read_errors += last.read_errors;
        if last.last_error.is_some() {
            self.last_error = last.last_error;
        }
        if last.value.is_some() {
            self.value = last.value;
        }
        if last.success {
            self.success = true;
            self.reason = None;
        }
        for mut attempt in last.history {
            attempt.number = number;
            self.push_history(attempt);
        }
    }

    /// Returns true when the observation matched
    fn record(&mut self, number: u32, start: Instant, observation: Observation<T>) -> bool {
        self.attempts = number;
        let matched = match &observation {
            Observation::Matched { value } => {
                self.value = Some(value.clone());
                true
            }
            Observation::Mismatched { value } => {
                self.value = Some(value.clone());
                self.mismatches += 1;
                false
            }
            Observation::ReadError { message } => {
                self.read_errors += 1;
                self.last_error = Some(message.clone());
                false
            }
        };
        self.push_history(PollAttempt {
            number,
            elapsed_ms: elapsed_ms(start),
            observation,
        });
        matched
    }

    fn finish(mut self, start: Instant, reason: Option<FailureReason>) -> Self {
        self.success = reason.is_none();
        self.reason = reason;
        self.elapsed_ms = elapsed_ms(start);
        self
    }
}

impl<T: Display> PollReport<T> {
    /// Convert into the matched value, or the error kind matching the failure
    pub fn into_result(self) -> Result<T> {
        match (self.success, self.value, self.reason) {
            (true, Some(value), _) => Ok(value),
            (_, Some(value), Some(FailureReason::Mismatch)) => Err(Error::Mismatch {
                expected: self.expected,
                observed: value.to_string(),
            }),
            (_, None, Some(FailureReason::ReadError)) => Err(Error::ReadFailed(
                self.last_error.unwrap_or_else(|| "unknown read error".to_string()),
            )),
            (_, value, _) => Err(Error::PollTimeout {
                expected: self.expected,
                attempts: self.attempts,
                elapsed_ms: self.elapsed_ms,
                last_value: value.map(|v| v.to_string()),
                read_errors: self.read_errors,
                last_error: self.last_error,
            }),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

type NoRecovery = fn(u32) -> Ready<std::result::Result<(), Infallible>>;

/// Samples observable state until an expectation holds or the bounds run out
#[derive(Debug, Clone)]
pub struct Retrier {
    bounds: PollBounds,
    label: String,
}

impl Retrier {
    pub fn new(bounds: PollBounds) -> Self {
        Self {
            bounds,
            label: "poll".to_string(),
        }
    }

    /// Name used in log lines
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn bounds(&self) -> &PollBounds {
        &self.bounds
    }

    /// Poll without a recovery action between samples
    pub async fn poll<T, E, S, SF>(&self, expected: &Expected<T>, sample: S) -> PollReport<T>
    where
        T: Clone + PartialEq + Display,
        E: Display,
        S: FnMut(u32) -> SF,
        SF: Future<Output = std::result::Result<T, E>>,
    {
        self.run(expected, sample, None::<NoRecovery>).await
    }

    /// Poll, running `recover` (reload, re-navigate, re-search) before every retry
    pub async fn poll_with_recovery<T, E, S, SF, R, RF, RE>(
        &self,
        expected: &Expected<T>,
        sample: S,
        recover: R,
    ) -> PollReport<T>
    where
        T: Clone + PartialEq + Display,
        E: Display,
        S: FnMut(u32) -> SF,
        SF: Future<Output = std::result::Result<T, E>>,
        R: FnMut(u32) -> RF,
        RF: Future<Output = std::result::Result<(), RE>>,
        RE: Display,
    {
        self.run(expected, sample, Some(recover)).await
    }

    /// Take exactly one sample. A wrong value is a `Mismatch`, not a timeout.
    pub async fn check_once<T, E, SF>(expected: &Expected<T>, sample: SF) -> PollReport<T>
    where
        T: Clone + PartialEq + Display,
        E: Display,
        SF: Future<Output = std::result::Result<T, E>>,
    {
        let start = Instant::now();
        let mut report = PollReport::started(expected.describe());
        let observation = observe(expected, sample.await);
        let reason = match &observation {
            Observation::Matched { .. } => None,
            Observation::Mismatched { .. } => Some(FailureReason::Mismatch),
            Observation::ReadError { .. } => Some(FailureReason::ReadError),
        };
        report.record(1, start, observation);
        report.finish(start, reason)
    }

    async fn run<T, E, S, SF, R, RF, RE>(
        &self,
        expected: &Expected<T>,
        mut sample: S,
        mut recover: Option<R>,
    ) -> PollReport<T>
    where
        T: Clone + PartialEq + Display,
        E: Display,
        S: FnMut(u32) -> SF,
        SF: Future<Output = std::result::Result<T, E>>,
        R: FnMut(u32) -> RF,
        RF: Future<Output = std::result::Result<(), RE>>,
        RE: Display,
    {
        let start = Instant::now();
        // A timeout too large to represent is no wall-clock bound at all
        let deadline = self.bounds.timeout.and_then(|t| start.checked_add(t));
        let mut report = PollReport::started(expected.describe());
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let observation = match bounded(deadline, sample(attempt)).await {
                Some(result) => observe(expected, result),
                None => Observation::ReadError {
                    message: "sample did not complete before the deadline".to_string(),
                },
            };

            debug!(
                label = %self.label,
                attempt,
                observation = observation_kind(&observation),
                "poll sample"
            );

            if report.record(attempt, start, observation) {
                debug!(label = %self.label, attempts = attempt, "expectation satisfied");
                return report.finish(start, None);
            }

            if self.exhausted(attempt, deadline) {
                break;
            }

            pause(deadline, self.bounds.interval_for(attempt)).await;
            if past(deadline) {
                break;
            }

            if let Some(recover) = recover.as_mut() {
                match bounded(deadline, recover(attempt)).await {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        warn!(label = %self.label, attempt, error = %e, "recovery action failed");
                        report.recovery_errors += 1;
                        report.last_error = Some(e.to_string());
                    }
                    None => break,
                }
            }
        }

        let report = report.finish(start, Some(FailureReason::Timeout));
        warn!(
            label = %self.label,
            attempts = report.attempts,
            elapsed_ms = report.elapsed_ms,
            read_errors = report.read_errors,
            expected = %report.expected,
            "poll bounds exhausted"
        );
        report
    }

    fn exhausted(&self, attempt: u32, deadline: Option<Instant>) -> bool {
        self.bounds.max_attempts.map_or(false, |max| attempt >= max) || past(deadline)
    }
}

fn observe<T, E>(expected: &Expected<T>, result: std::result::Result<T, E>) -> Observation<T>
where
    T: PartialEq + Display,
    E: Display,
{
    match result {
        Ok(value) if expected.is_satisfied_by(&value) => Observation::Matched { value },
        Ok(value) => Observation::Mismatched { value },
        Err(e) => Observation::ReadError { message: e.to_string() },
    }
}

fn observation_kind<T>(observation: &Observation<T>) -> &'static str {
    match observation {
        Observation::Matched { .. } => "matched",
        Observation::Mismatched { .. } => "mismatched",
        Observation::ReadError { .. } => "read_error",
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |d| Instant::now() >= d)
}

/// Run `fut`, giving up at the deadline
async fn bounded<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(d) => timeout_at(d, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn pause(deadline: Option<Instant>, interval: Duration) {
    if interval.is_zero() {
        // Let other tasks run between back-to-back samples
        yield_now().await;
        return;
    }
    match (Instant::now().checked_add(interval), deadline) {
        (Some(wake), Some(d)) => sleep_until(wake.min(d)).await,
        (Some(wake), None) => sleep_until(wake).await,
        (None, Some(d)) => sleep_until(d).await,
        (None, None) => sleep(interval).await,
    }
}
