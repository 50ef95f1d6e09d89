//! A reusable retry combinator, replacing the Python original's
//! decorator-based `@retry_on_failure`. Retries a fallible synchronous
//! operation a fixed number of times with a fixed delay between attempts,
//! but only when the error is one the caller flags as retriable — parse
//! and logic errors should fail fast instead.

use std::thread;
use std::time::Duration;
use tracing::warn;

/// Runs `op` up to `attempts` times with `delay` between attempts, retrying
/// only while `is_retriable` returns `true` for the error it produced. The
/// last error is returned if every attempt fails.
pub fn with_retry<T, E>(
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> Result<T, E>,
    is_retriable: impl Fn(&E) -> bool,
) -> Result<T, E> {
    assert!(attempts >= 1, "attempts must be at least 1");
    let mut last_err = None;

    for attempt in 1..=attempts {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                let retriable = is_retriable(&e);
                if attempt == attempts || !retriable {
                    return Err(e);
                }
                warn!(attempt, attempts, "operation failed, retrying");
                last_err = Some(e);
                thread::sleep(delay);
            }
        }
    }

    // Unreachable in practice: the loop above always returns by the last
    // iteration, but the compiler can't see that without this fallback.
    Err(last_err.expect("at least one attempt was made"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn succeeds_without_retry_when_first_attempt_ok() {
        let calls = Cell::new(0);
        let result = with_retry(
            3,
            Duration::from_millis(0),
            || {
                calls.set(calls.get() + 1);
                Ok::<_, &'static str>(42)
            },
            |_| true,
        );
        assert_eq!(result, Ok(42));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retries_up_to_attempt_limit_then_fails() {
        let calls = Cell::new(0);
        let result = with_retry(
            3,
            Duration::from_millis(0),
            || {
                calls.set(calls.get() + 1);
                Err::<i32, _>("transport down")
            },
            |_| true,
        );
        assert_eq!(result, Err("transport down"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_retriable_error_fails_immediately() {
        let calls = Cell::new(0);
        let result = with_retry(
            3,
            Duration::from_millis(0),
            || {
                calls.set(calls.get() + 1);
                Err::<i32, _>("parse error")
            },
            |_| false,
        );
        assert_eq!(result, Err("parse error"));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn succeeds_on_a_later_attempt() {
        let calls = Cell::new(0);
        let result = with_retry(
            3,
            Duration::from_millis(0),
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 2 {
                    Err("not yet")
                } else {
                    Ok(99)
                }
            },
            |_| true,
        );
        assert_eq!(result, Ok(99));
        assert_eq!(calls.get(), 2);
    }
}
