//! Consumer-side configuration.

use std::time::Duration;

/// How a stopping consumer treats the handler that is currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let the in-flight handler finish; its offset is committed.
    #[default]
    WaitForCompletion,
    /// Cancel the in-flight handler via its token; its offset is not
    /// committed and the message is redelivered.
    CancelCurrent,
}

/// Tuning knobs for a message consumer.
///
/// The poll interval bounds how long a shutdown request can go unnoticed;
/// the commit interval bounds how much progress a crash can lose (all of
/// it is redelivered, never skipped).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub poll_interval: Duration,
    pub commit_interval: Duration,
    pub retry_backoff: Duration,
    pub shutdown: ShutdownMode,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            commit_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_secs(1),
            shutdown: ShutdownMode::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_shutdown_mode(mut self, mode: ShutdownMode) -> Self {
        self.shutdown = mode;
        self
    }
}
