use super::{Counters, Delivered, DeliveryHandler, DeliveryOutcome, InFlight};
use crate::pending::PendingSet;
use crate::transport::{DeliveryReport, DeliveryReports};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Consumes delivery reports until every reporter is gone.
///
/// Resolving the pending entry is the only shared state this task touches.
/// The entry stays counted until its outcome has been handed on.
pub(crate) struct DeliveryObserver<R> {
    pending: Arc<PendingSet<InFlight<R>>>,
    counters: Arc<Counters>,
    handler: Arc<dyn DeliveryHandler<R>>,
}

impl<R: Send + Sync + 'static> DeliveryObserver<R> {
    pub(crate) fn new(
        pending: Arc<PendingSet<InFlight<R>>>,
        counters: Arc<Counters>,
        handler: Arc<dyn DeliveryHandler<R>>,
    ) -> Self {
        Self {
            pending,
            counters,
            handler,
        }
    }

    pub(crate) fn spawn(self, mut reports: DeliveryReports) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                self.observe(report);
            }
            debug!("Delivery channel closed, observer stopping");
        })
    }

    pub(crate) fn observe(&self, report: DeliveryReport) {
        let Some(mut in_flight) = self.pending.resolve(report.seq) else {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            warn!(seq = report.seq, "Delivery report for unknown or already resolved submission");
            return;
        };

        let outcome = match report.result {
            Ok(position) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Success {
                    partition: position.partition,
                    offset: position.offset,
                    elapsed: in_flight.submitted_at.elapsed(),
                }
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Failure {
                    reason: error.message,
                    kind: error.kind,
                }
            }
        };

        let delivered = Delivered {
            seq: report.seq,
            key: std::mem::take(&mut in_flight.key),
            record: Arc::clone(&in_flight.record),
            outcome,
        };

        self.handler.on_delivery(&delivered);

        if let Some(completion) = in_flight.completion.take() {
            // The caller may have dropped its handle; that is not an error.
            let _ = completion.send(delivered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, TransportError};
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::sync::oneshot;

    fn in_flight(key: &str) -> InFlight<String> {
        InFlight {
            key: key.to_string(),
            record: Arc::new(format!("record for {}", key)),
            submitted_at: Instant::now(),
            completion: None,
        }
    }

    fn observer_with_log() -> (DeliveryObserver<String>, Arc<Mutex<Vec<Delivered<String>>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let observer = DeliveryObserver::new(
            Arc::new(PendingSet::new()),
            Arc::new(Counters::default()),
            Arc::new(move |d: &Delivered<String>| sink.lock().unwrap().push(d.clone())),
        );
        (observer, log)
    }

    #[test]
    fn test_success_and_failure_reported_once() {
        let (observer, log) = observer_with_log();
        observer.pending.register(0, in_flight("user-0"));
        observer.pending.register(1, in_flight("user-1"));
        observer.pending.mark_accepted(0);
        observer.pending.mark_accepted(1);

        observer.observe(DeliveryReport::delivered(0, 2, 17));
        observer.observe(DeliveryReport::failed(1, TransportError::transient("timed out")));
        observer.observe(DeliveryReport::delivered(0, 2, 17));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(matches!(
            log[0].outcome,
            DeliveryOutcome::Success { partition: 2, offset: 17, .. }
        ));
        assert_eq!(log[0].record.as_str(), "record for user-0");
        assert!(matches!(
            &log[1].outcome,
            DeliveryOutcome::Failure { kind: ErrorKind::Transient, reason } if reason == "timed out"
        ));

        assert!(observer.pending.is_empty());
        assert_eq!(observer.counters.succeeded.load(Ordering::Relaxed), 1);
        assert_eq!(observer.counters.failed.load(Ordering::Relaxed), 1);
        assert_eq!(observer.counters.unmatched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_completion_receives_outcome() {
        let (observer, _log) = observer_with_log();
        let (tx, mut rx) = oneshot::channel();
        let mut entry = in_flight("user-3");
        entry.completion = Some(tx);
        observer.pending.register(3, entry);
        observer.pending.mark_accepted(3);

        observer.observe(DeliveryReport::delivered(3, 0, 5));

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.seq, 3);
        assert_eq!(delivered.key, "user-3");
        assert_eq!(delivered.outcome.offset(), Some(5));
    }
}
