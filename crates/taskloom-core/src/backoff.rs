//! Retry backoff strategies, spec.md §4.3.
//!
//! A strategy is a pure function of `{attempt, error, jobName, data}` that
//! returns either a delay or "stop", boxed as `Arc<dyn Fn(...) + Send + Sync>`
//! so it can be cloned into the processor and shared across concurrent runs.

use std::sync::Arc;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct BackoffInput {
    pub attempt: u32,
    pub error: String,
    pub job_name: String,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffOutcome {
    Delay(i64),
    Stop,
}

pub type BackoffFn = Arc<dyn Fn(BackoffInput) -> BackoffOutcome + Send + Sync>;

fn apply_jitter(delay_ms: i64, jitter: f64) -> i64 {
    if jitter <= 0.0 {
        return delay_ms;
    }
    let jitter = jitter.clamp(0.0, 1.0);
    let spread = (delay_ms as f64) * jitter;
    let offset = (fastrand::f64() * 2.0 - 1.0) * spread;
    (delay_ms as f64 + offset).max(0.0).round() as i64
}

/// Fixed delay on every attempt, bounded by `max_retries`.
pub fn constant(delay_ms: i64, max_retries: u32, jitter: f64) -> BackoffFn {
    Arc::new(move |input| {
        if input.attempt > max_retries {
            return BackoffOutcome::Stop;
        }
        BackoffOutcome::Delay(apply_jitter(delay_ms, jitter))
    })
}

/// `delay * attempt`, capped at `max_delay_ms` if set.
pub fn linear(delay_ms: i64, max_retries: u32, max_delay_ms: Option<i64>, jitter: f64) -> BackoffFn {
    Arc::new(move |input| {
        if input.attempt > max_retries {
            return BackoffOutcome::Stop;
        }
        let raw = delay_ms.saturating_mul(input.attempt as i64);
        let capped = max_delay_ms.map_or(raw, |m| raw.min(m));
        BackoffOutcome::Delay(apply_jitter(capped, jitter))
    })
}

/// `delay * factor^(attempt-1)`, capped at `max_delay_ms` if set.
pub fn exponential(
    delay_ms: i64,
    factor: f64,
    max_retries: u32,
    max_delay_ms: Option<i64>,
    jitter: f64,
) -> BackoffFn {
    Arc::new(move |input| {
        if input.attempt > max_retries {
            return BackoffOutcome::Stop;
        }
        let raw = (delay_ms as f64) * factor.powi(input.attempt as i32 - 1);
        let capped = max_delay_ms.map_or(raw, |m| raw.min(m as f64));
        BackoffOutcome::Delay(apply_jitter(capped.round() as i64, jitter))
    })
}

/// Tries each strategy in order until one returns a delay.
pub fn combine(strategies: Vec<BackoffFn>) -> BackoffFn {
    Arc::new(move |input| {
        for s in &strategies {
            if let BackoffOutcome::Delay(ms) = s(input.clone()) {
                return BackoffOutcome::Delay(ms);
            }
        }
        BackoffOutcome::Stop
    })
}

/// Wraps a strategy so it only applies when `predicate` returns true;
/// otherwise stops immediately (e.g. "only retry on transient errors").
pub fn when(predicate: impl Fn(&BackoffInput) -> bool + Send + Sync + 'static, inner: BackoffFn) -> BackoffFn {
    Arc::new(move |input| {
        if predicate(&input) {
            inner(input)
        } else {
            BackoffOutcome::Stop
        }
    })
}

/// 100ms, ×2, 3 tries, no jitter.
pub fn aggressive() -> BackoffFn {
    exponential(100, 2.0, 3, None, 0.0)
}

/// 1s, ×2, 5 tries, 10% jitter.
pub fn standard() -> BackoffFn {
    exponential(1_000, 2.0, 5, None, 0.10)
}

/// 5s, ×3, 4 tries, 10% jitter.
pub fn relaxed() -> BackoffFn {
    exponential(5_000, 3.0, 4, None, 0.10)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(attempt: u32) -> BackoffInput {
        BackoffInput {
            attempt,
            error: "boom".into(),
            job_name: "job".into(),
            data: Value::Null,
        }
    }

    #[test]
    fn exponential_no_jitter_doubles() {
        let b = exponential(100, 2.0, 3, None, 0.0);
        assert_eq!(b(input(1)), BackoffOutcome::Delay(100));
        assert_eq!(b(input(2)), BackoffOutcome::Delay(200));
        assert_eq!(b(input(3)), BackoffOutcome::Delay(400));
        assert_eq!(b(input(4)), BackoffOutcome::Stop);
    }

    #[test]
    fn linear_caps_at_max_delay() {
        let b = linear(100, 10, Some(250), 0.0);
        assert_eq!(b(input(1)), BackoffOutcome::Delay(100));
        assert_eq!(b(input(2)), BackoffOutcome::Delay(200));
        assert_eq!(b(input(3)), BackoffOutcome::Delay(250));
    }

    #[test]
    fn combine_falls_through_to_next_strategy() {
        let never = Arc::new(|_: BackoffInput| BackoffOutcome::Stop);
        let always = constant(50, 100, 0.0);
        let b = combine(vec![never, always]);
        assert_eq!(b(input(1)), BackoffOutcome::Delay(50));
    }

    #[test]
    fn presets_stop_after_configured_retries() {
        let b = standard();
        for attempt in 1..=5 {
            assert!(matches!(b(input(attempt)), BackoffOutcome::Delay(_)));
        }
        assert_eq!(b(input(6)), BackoffOutcome::Stop);
    }
}
