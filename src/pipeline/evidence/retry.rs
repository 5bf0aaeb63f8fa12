use std::sync::Arc;
use std::time::{Duration, Instant};

use super::types::{InferenceRequest, RawOutput, VisionGateway};
use super::EvidenceError;

/// Default attempts when retrying is switched on.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Opt-in decorator that retries connection-level failures.
///
/// Only `InferenceUnavailable` is retried. A timeout means the deadline is
/// spent, and schema problems are decided by the caller, so both pass
/// through unchanged. All attempts share the one deadline given to
/// `invoke`: each attempt gets whatever budget is left, and no attempt
/// starts once the budget is gone.
pub struct RetryingGateway {
    inner: Arc<dyn VisionGateway>,
    max_attempts: u32,
    backoff: Duration,
}

impl RetryingGateway {
    pub fn new(inner: Arc<dyn VisionGateway>) -> Self {
        Self {
            inner,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Total attempts including the first. Clamped to at least one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl VisionGateway for RetryingGateway {
    fn invoke(
        &self,
        request: &InferenceRequest<'_>,
        deadline: Duration,
    ) -> Result<RawOutput, EvidenceError> {
        let start = Instant::now();
        let mut attempt = 1;

        loop {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(EvidenceError::timeout(deadline));
            }

            match self.inner.invoke(request, remaining) {
                Err(EvidenceError::InferenceUnavailable(reason)) if attempt < self.max_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %reason,
                        "Vision inference unavailable, retrying"
                    );

                    // Not enough budget left for the pause and another try.
                    if start.elapsed() + self.backoff >= deadline {
                        return Err(EvidenceError::InferenceUnavailable(reason));
                    }
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
                // A timeout from the inner gateway reflects only its share of
                // the budget. Report the full deadline to the caller.
                Err(EvidenceError::InferenceTimeout { .. }) => {
                    return Err(EvidenceError::timeout(deadline));
                }
                other => return other,
            }
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}
