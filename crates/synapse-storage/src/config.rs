//! Tunables injected into every context and manager

use std::time::Duration;
use synapse_sp::RetryPolicy;

/// Upload, batching and polling settings
#[derive(Clone, Debug, PartialEq)]
pub struct UploadSettings {
    /// Maximum pieces committed in one add-pieces call
    pub upload_batch_size: usize,
    /// Overall deadline for a piece to be reported parked
    pub park_timeout: Duration,
    /// Interval between parked checks
    pub park_poll_interval: Duration,
    /// Poll interval while waiting for in-flight uploads to join a batch
    pub batch_wait_poll: Duration,
    /// Cap on that wait
    pub batch_wait_max: Duration,
    /// Overall deadline for a provider-to-provider pull
    pub pull_timeout: Duration,
    /// Interval between pull status checks
    pub pull_poll_interval: Duration,
    /// Providers tried per secondary slot before giving up
    pub max_replacement_attempts: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            upload_batch_size: 32,
            park_timeout: Duration::from_secs(5 * 60),
            park_poll_interval: Duration::from_secs(4),
            batch_wait_poll: Duration::from_millis(200),
            batch_wait_max: Duration::from_secs(15),
            pull_timeout: Duration::from_secs(10 * 60),
            pull_poll_interval: Duration::from_secs(4),
            max_replacement_attempts: 5,
        }
    }
}

impl UploadSettings {
    /// Set the batch size (at least one)
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size.max(1);
        self
    }

    /// Set the parked wait
    pub fn with_park_wait(mut self, interval: Duration, timeout: Duration) -> Self {
        self.park_poll_interval = interval;
        self.park_timeout = timeout;
        self
    }

    /// Set the batch wait heuristic
    pub fn with_batch_wait(mut self, poll: Duration, max: Duration) -> Self {
        self.batch_wait_poll = poll;
        self.batch_wait_max = max;
        self
    }

    /// Set the pull wait
    pub fn with_pull_wait(mut self, interval: Duration, timeout: Duration) -> Self {
        self.pull_poll_interval = interval;
        self.pull_timeout = timeout;
        self
    }

    /// Set the replacement budget per secondary slot
    pub fn with_max_replacement_attempts(mut self, attempts: usize) -> Self {
        self.max_replacement_attempts = attempts.max(1);
        self
    }

    pub(crate) fn park_policy(&self) -> RetryPolicy {
        RetryPolicy::polling(self.park_poll_interval, self.park_timeout)
    }

    pub(crate) fn pull_policy(&self) -> RetryPolicy {
        RetryPolicy::polling(self.pull_poll_interval, self.pull_timeout)
    }
}
