//! Bounded polling of long-running warehouse jobs

use std::future::Future;
use std::time::Duration;

use crate::adapter::FetchError;

/// State of a job at one poll
#[derive(Debug, Clone, PartialEq)]
pub enum JobState<T> {
    Running,
    Done(T),
}

/// Polls a job at a fixed interval until it finishes or the attempts run out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPoller {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for JobPoller {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 100,
        }
    }
}

impl JobPoller {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Check `poll` once, then again after each interval, up to
    /// `max_attempts` further times
    ///
    /// A job still running after the last attempt is a [`FetchError::JobTimeout`].
    /// Nothing is rolled back.
    pub async fn wait<T, F, Fut>(&self, job: &str, mut poll: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<JobState<T>, FetchError>>,
    {
        if let JobState::Done(value) = poll().await? {
            return Ok(value);
        }

        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;
            match poll().await? {
                JobState::Done(value) => {
                    tracing::debug!(job, attempt, "job finished");
                    return Ok(value);
                }
                JobState::Running => {
                    tracing::debug!(job, attempt, "job still running");
                }
            }
        }

        tracing::warn!(job, attempts = self.max_attempts, "job did not finish");
        Err(FetchError::JobTimeout {
            job: job.to_string(),
            attempts: self.max_attempts,
        })
    }
}
