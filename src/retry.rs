//! Bounded retry with exponential backoff, expressed as a small state machine
//! so callers drive it explicitly and tests can step through it without sleeping.

use std::time::Duration;

/// backoff policy for a retried operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// total attempts including the first one
    pub max_attempts: u32,
    /// delay after the first failure
    pub initial_delay: Duration,
    /// cap for any single delay
    pub max_delay: Duration,
    /// multiplier applied per failed attempt
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// delay before attempt `attempt` (1-based attempt that just failed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
            state: BackoffState::Ready,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffState {
    /// the next attempt may run now
    Ready,
    /// the last attempt failed, wait before trying again
    Waiting(Duration),
    /// the last attempt succeeded
    Succeeded,
    /// attempts are exhausted
    GaveUp,
}

/// one retried operation in flight
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    state: BackoffState,
}

impl Backoff {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    pub fn record_success(&mut self) -> BackoffState {
        self.attempts += 1;
        self.state = BackoffState::Succeeded;
        self.state
    }

    pub fn record_failure(&mut self) -> BackoffState {
        self.attempts += 1;
        self.state = if self.attempts >= self.policy.max_attempts {
            BackoffState::GaveUp
        } else {
            BackoffState::Waiting(self.policy.delay_for_attempt(self.attempts))
        };
        self.state
    }

    /// run `op` until it succeeds or the policy gives up, returning the last error
    pub async fn run<T, E, F, Fut>(mut self, mut op: F) -> Result<T, (E, u32)>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        loop {
            match op().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => match self.record_failure() {
                    BackoffState::Waiting(delay) => tokio::time::sleep(delay).await,
                    _ => return Err((e, self.attempts)),
                },
            }
        }
    }
}
