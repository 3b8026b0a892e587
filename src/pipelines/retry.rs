use std::future::Future;

use log::warn;

use crate::config::defs::PipelineError;
use crate::pipelines::graph::StepKind;

/// Per-step retry attribute. Attempts are immediate; there is no backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retryable: bool,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn fail_fast() -> Self {
        RetryPolicy { retryable: false, max_attempts: 1 }
    }

    pub const fn retry(additional_attempts: u32) -> Self {
        RetryPolicy { retryable: true, max_attempts: additional_attempts + 1 }
    }

    /// Runs `attempt` until it succeeds or the policy is exhausted.
    /// `attempt` receives the 1-based attempt number and must redo the step from scratch.
    ///
    /// # Arguments
    ///
    /// * `step` - Step being run, for logging.
    /// * `attempt` - Closure producing one attempt's future.
    ///
    /// # Returns
    /// First successful result, or the last error.
    pub async fn run<T, F, Fut>(&self, step: StepKind, mut attempt: F) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let max_attempts = if self.retryable { self.max_attempts.max(1) } else { 1 };
        let mut n = 1;
        loop {
            match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(e) if n < max_attempts => {
                    warn!("{} attempt {}/{} failed: {}. Retrying.", step, n, max_attempts, e);
                    n += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fail_fast()
    }
}
