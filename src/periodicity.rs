//! Periodicity arithmetic: interval lengths, next due time, overdue detection.
//!
//! Everything here is pure; callers pass `now` in explicitly.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::model::{Configuration, Periodicity};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeriodicityError {
    #[error("unknown periodicity code '{0}'")]
    UnknownCode(String),
}

impl FromStr for Periodicity {
    type Err = PeriodicityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Periodicity::ALL
            .into_iter()
            .find(|p| p.code() == s)
            .ok_or_else(|| PeriodicityError::UnknownCode(s.to_string()))
    }
}

impl Periodicity {
    /// Fixed interval length. `1m` is thirty days, not a calendar month.
    pub fn delta(self) -> Duration {
        match self {
            Periodicity::EveryTwoMinutes => Duration::minutes(2),
            Periodicity::EveryTwoHours => Duration::hours(2),
            Periodicity::EverySixHours => Duration::hours(6),
            Periodicity::Daily => Duration::days(1),
            Periodicity::Weekly => Duration::weeks(1),
            Periodicity::Monthly => Duration::days(30),
        }
    }
}

/// Interval length for a stored periodicity code.
pub fn delta(code: &str) -> Result<Duration, PeriodicityError> {
    code.parse::<Periodicity>().map(Periodicity::delta)
}

/// When the configuration is next due, or `None` if it will not run again.
///
/// Never returns a time before `now`. A configuration whose activation lies in
/// the future first runs exactly at activation.
pub fn next_execution_time(
    config: &Configuration,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, PeriodicityError> {
    let delta = delta(&config.periodicity)?;

    if !config.is_active || config.deactivation_at.is_some_and(|d| now >= d) {
        return Ok(None);
    }
    if let Some(activation) = config.activation_at {
        if now < activation {
            return Ok(Some(activation));
        }
    }

    let base = config.last_execution.or(config.activation_at).unwrap_or(now);
    let next = advance_past(base + delta, delta, now);

    if config.deactivation_at.is_some_and(|d| next > d) {
        return Ok(None);
    }
    Ok(Some(next))
}

/// Longest preview window, one leap year.
const MAX_PREVIEW_HOURS: u64 = 366 * 24;

/// Every due time in `(now, now + hours]`, stopping at deactivation.
pub fn next_executions_within(
    config: &Configuration,
    now: DateTime<Utc>,
    hours: u64,
) -> Result<Vec<DateTime<Utc>>, PeriodicityError> {
    let delta = delta(&config.periodicity)?;
    if !config.is_active {
        return Ok(Vec::new());
    }

    let limit = now + Duration::hours(hours.min(MAX_PREVIEW_HOURS) as i64);
    let base = config.last_execution.or(config.activation_at).unwrap_or(now);
    let mut next = if base > now {
        base
    } else {
        let first = advance_past(base, delta, now);
        if first == now { first + delta } else { first }
    };

    let mut times = Vec::new();
    while next <= limit {
        if config.deactivation_at.is_some_and(|d| next > d) {
            break;
        }
        times.push(next);
        next += delta;
    }
    Ok(times)
}

/// Missed-cycle check relative to the last recorded run.
///
/// Returns whether a full interval has elapsed since `last_execution` and by
/// how much the expected run is late. The validity window is ignored on
/// purpose: a configuration about to be deactivated can still be overdue.
pub fn is_overdue(
    config: &Configuration,
    now: DateTime<Utc>,
) -> Result<(bool, Duration), PeriodicityError> {
    let delta = delta(&config.periodicity)?;
    let Some(last) = config.last_execution else {
        return Ok((false, Duration::zero()));
    };
    let expected = last + delta;
    if now >= expected {
        Ok((true, now - expected))
    } else {
        Ok((false, Duration::zero()))
    }
}

/// Smallest `start + k * delta` (k >= 0) that is not before `now`.
fn advance_past(start: DateTime<Utc>, delta: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    if start >= now {
        return start;
    }
    let behind = (now - start).num_milliseconds();
    let step = delta.num_milliseconds().max(1);
    let steps = (behind + step - 1) / step;
    start + Duration::milliseconds(steps * step)
}
