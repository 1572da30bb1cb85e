use crate::transport::{Submission, Transport};
use crate::{Error, Result};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long to keep retrying a submission while the transport's local
/// queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressurePolicy {
    /// Pause between attempts.
    pub wait: Duration,
    /// Retries after the first attempt; `None` is unbounded.
    pub max_retries: Option<u32>,
    /// Overall time budget for one submission; `None` is unbounded.
    pub deadline: Option<Duration>,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(2000),
            max_retries: Some(30),
            deadline: None,
        }
    }
}

impl BackpressurePolicy {
    pub fn unbounded(wait: Duration) -> Self {
        Self {
            wait,
            max_retries: None,
            deadline: None,
        }
    }

    /// Whether another wait-and-retry is allowed after `retries` retries and
    /// `elapsed` time.
    pub fn allows_retry(&self, retries: u32, elapsed: Duration) -> bool {
        if self.max_retries.is_some_and(|max| retries >= max) {
            return false;
        }
        match self.deadline {
            Some(deadline) => elapsed + self.wait <= deadline,
            None => true,
        }
    }
}

/// A submission the transport took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub retries: u32,
    pub waited: Duration,
}

/// Submits `submission`, waiting and retrying the identical submission
/// while the transport reports a full local queue.
///
/// The wait is an async sleep, so the delivery observer and the transport's
/// own worker keep draining the queue meanwhile. Any other error is
/// returned at once without a retry.
pub async fn submit_with_backpressure<T, R>(
    transport: &T,
    submission: Submission<R>,
    policy: &BackpressurePolicy,
) -> Result<Accepted>
where
    T: Transport<R> + ?Sized,
{
    let started = Instant::now();
    let mut retries = 0u32;
    let mut submission = submission;

    loop {
        match transport.submit(submission) {
            Ok(()) => {
                if retries > 0 {
                    debug!(retries, "Submission accepted after backpressure");
                }
                return Ok(Accepted {
                    retries,
                    waited: started.elapsed(),
                });
            }
            Err((error, returned)) if error.is_queue_full() => {
                if !policy.allows_retry(retries, started.elapsed()) {
                    return Err(Error::RetriesExhausted {
                        attempts: retries + 1,
                        waited: started.elapsed(),
                    });
                }
                warn!(
                    seq = returned.seq,
                    key = %returned.key,
                    retry = retries + 1,
                    "Local delivery queue full, retrying in {:?}: {}",
                    policy.wait,
                    error.message
                );
                tokio::time::sleep(policy.wait).await;
                retries += 1;
                submission = returned;
            }
            Err((error, _)) => return Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{delivery_channel, FakeTransport};
    use crate::{ErrorKind, TransportError};
    use std::sync::Arc;

    fn submission(seq: u64) -> Submission<()> {
        Submission {
            seq,
            topic: "test".to_string(),
            key: format!("user-{}", seq),
            record: Arc::new(()),
            payload: b"payload".to_vec(),
        }
    }

    fn fast_policy(max_retries: Option<u32>) -> BackpressurePolicy {
        BackpressurePolicy {
            wait: Duration::from_millis(1),
            max_retries,
            deadline: None,
        }
    }

    #[test]
    fn test_policy_limits() {
        let policy = fast_policy(Some(2));
        assert!(policy.allows_retry(0, Duration::ZERO));
        assert!(policy.allows_retry(1, Duration::ZERO));
        assert!(!policy.allows_retry(2, Duration::ZERO));

        let policy = BackpressurePolicy {
            wait: Duration::from_secs(2),
            max_retries: None,
            deadline: Some(Duration::from_secs(5)),
        };
        assert!(policy.allows_retry(100, Duration::from_secs(3)));
        assert!(!policy.allows_retry(0, Duration::from_secs(4)));

        let unbounded = BackpressurePolicy::unbounded(Duration::from_secs(1));
        assert!(unbounded.allows_retry(u32::MAX, Duration::MAX / 2));
    }

    #[tokio::test]
    async fn test_retries_same_submission_until_accepted() {
        let (reporter, _reports) = delivery_channel();
        let transport =
            FakeTransport::new(reporter).reject(4, TransportError::queue_full("full"), 3);

        let accepted = submit_with_backpressure(&transport, submission(4), &fast_policy(None))
            .await
            .unwrap();
        assert_eq!(accepted.retries, 3);

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 4);
        assert!(attempts.iter().all(|a| a.key == "user-4" && a.payload == b"payload"));
        assert_eq!(transport.accepted().len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (reporter, _reports) = delivery_channel();
        let transport = FakeTransport::new(reporter).reject_all(TransportError::queue_full("full"));

        let err = submit_with_backpressure(&transport, submission(0), &fast_policy(Some(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(transport.attempts_for(0), 3);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let (reporter, _reports) = delivery_channel();
        let transport =
            FakeTransport::new(reporter).reject(0, TransportError::rejected("too large"), 1);

        let err = submit_with_backpressure(&transport, submission(0), &fast_policy(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(transport.attempts_for(0), 1);
        assert!(transport.accepted().is_empty());
    }
}
