// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded waits on asynchronous conditions
//!
//! Every blocking wait in the control plane (a process accepting RPCs,
//! replication lag settling, a background upgrade finishing) goes through one
//! of the helpers here.  They sleep a fixed interval between checks and give
//! up after either a maximum duration or a maximum number of attempts.  There
//! are no unbounded spins.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one evaluation of a condition
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// the condition has not yet happened
    NotYet,
    /// the condition will never become true
    Failed(E),
}

/// Result of a bounded wait
#[derive(Debug)]
pub enum Error<E> {
    TimedOut(Duration),
    AttemptsExhausted { attempts: u32, elapsed: Duration },
    PermanentError(E),
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TimedOut(elapsed) => write!(f, "timed out after {elapsed:?}"),
            Error::AttemptsExhausted { attempts, elapsed } => {
                write!(f, "gave up after {attempts} attempts ({elapsed:?})")
            }
            Error::PermanentError(e) => write!(f, "permanent error: {e}"),
        }
    }
}

impl<E> Error<E> {
    /// Returns how long the wait ran before giving up, if it gave up because
    /// of its bound (rather than a permanent error).
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Error::TimedOut(elapsed) => Some(*elapsed),
            Error::AttemptsExhausted { elapsed, .. } => Some(*elapsed),
            Error::PermanentError(_) => None,
        }
    }
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// a given time has expired
///
/// The condition is always evaluated at least once, so a zero `poll_max`
/// amounts to a single check.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => (),
        }

        if duration >= *poll_max {
            return Err(Error::TimedOut(duration));
        }

        tokio::time::sleep(*poll_interval).await;
    }
}

/// Poll the given closure at most `max_attempts` times, sleeping
/// `poll_interval` between attempts
///
/// `max_attempts` of zero is treated as one: the condition is always checked.
pub async fn wait_for_condition_attempts<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    max_attempts: u32,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => (),
        }

        if attempt >= max_attempts {
            return Err(Error::AttemptsExhausted {
                attempts: attempt,
                elapsed: poll_start.elapsed(),
            });
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
