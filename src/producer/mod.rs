//! The producer session: submission, delivery tracking and draining.
//!
//! A [`ProducerSession`] owns one transport, one delivery observer task and
//! the set of submissions still waiting for their outcome. Submissions go
//! through the backpressure controller on their way to the transport;
//! outcomes come back through the observer, which hands them to the
//! session's [`DeliveryHandler`] and, for tracked submissions, to the
//! caller's [`DeliveryHandle`].
//!
//! Outcomes arrive in whatever order the transport resolves them. Nothing
//! here orders them by submission, not even within one key.
//!
//! # Example
//!
//! ```rust,no_run
//! use delivery_pipeline::producer::{BackpressurePolicy, ProducerSession};
//! use delivery_pipeline::record::UserRecord;
//! use delivery_pipeline::serializer::{JsonSerializer, RecordSerializer};
//! use delivery_pipeline::transport::{delivery_channel, FakeTransport};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> delivery_pipeline::Result<()> {
//! let (reporter, reports) = delivery_channel();
//! let transport = Arc::new(FakeTransport::new(reporter));
//! let serializer: Arc<dyn RecordSerializer<UserRecord>> = Arc::new(JsonSerializer::compact());
//! let session = ProducerSession::builder(transport, reports, serializer)
//!     .policy(BackpressurePolicy::default())
//!     .start();
//!
//! session.submit("users", "user-0", UserRecord::for_index(0, 8)).await?;
//! let stats = session.close(Duration::from_secs(10)).await?;
//! assert_eq!(stats.pending, 0);
//! # Ok(())
//! # }
//! ```

mod backpressure;
mod observer;

pub use backpressure::{submit_with_backpressure, Accepted, BackpressurePolicy};

use crate::pending::PendingSet;
use crate::serializer::RecordSerializer;
use crate::transport::{DeliveryReports, Submission, Transport};
use crate::{Error, ErrorKind, Result, TransportError};
use observer::DeliveryObserver;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// How the runner waits for outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProducerMode {
    /// Submit and move on; outcomes go to the delivery handler.
    #[default]
    Callback,
    /// Submit everything, keeping a handle per submission, then await them all.
    FireAndCollect,
    /// Await each outcome before submitting the next record.
    Synchronous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success {
        partition: i32,
        offset: i64,
        elapsed: Duration,
    },
    Failure {
        reason: String,
        kind: ErrorKind,
    },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }

    pub fn offset(&self) -> Option<i64> {
        match self {
            DeliveryOutcome::Success { offset, .. } => Some(*offset),
            DeliveryOutcome::Failure { .. } => None,
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Success {
                partition,
                offset,
                elapsed,
            } => write!(
                f,
                "partition {} offset {} in {} ms",
                partition,
                offset,
                elapsed.as_millis()
            ),
            DeliveryOutcome::Failure { reason, kind } => write!(f, "{} ({})", reason, kind),
        }
    }
}

/// The outcome of one submission together with what was submitted.
#[derive(Debug)]
pub struct Delivered<R> {
    pub seq: u64,
    pub key: String,
    pub record: Arc<R>,
    pub outcome: DeliveryOutcome,
}

impl<R> Clone for Delivered<R> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            key: self.key.clone(),
            record: Arc::clone(&self.record),
            outcome: self.outcome.clone(),
        }
    }
}

/// Receives every delivery outcome of a session, once each.
///
/// Called from the observer task, concurrently with new submissions.
pub trait DeliveryHandler<R>: Send + Sync + 'static {
    fn on_delivery(&self, delivered: &Delivered<R>);
}

impl<R, F> DeliveryHandler<R> for F
where
    F: Fn(&Delivered<R>) + Send + Sync + 'static,
{
    fn on_delivery(&self, delivered: &Delivered<R>) {
        self(delivered)
    }
}

/// Logs each outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl<R> DeliveryHandler<R> for LoggingHandler {
    fn on_delivery(&self, delivered: &Delivered<R>) {
        match &delivered.outcome {
            DeliveryOutcome::Success {
                partition,
                offset,
                elapsed,
            } => info!(
                seq = delivered.seq,
                key = %delivered.key,
                partition,
                offset,
                elapsed_ms = elapsed.as_millis() as u64,
                "Delivered"
            ),
            DeliveryOutcome::Failure { reason, kind } => warn!(
                seq = delivered.seq,
                key = %delivered.key,
                %kind,
                "Delivery failed: {}",
                reason
            ),
        }
    }
}

/// The eventual outcome of a tracked submission.
#[derive(Debug)]
pub struct DeliveryHandle<R> {
    seq: u64,
    rx: oneshot::Receiver<Delivered<R>>,
}

impl<R> DeliveryHandle<R> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits for the outcome. Fails with [`Error::Closed`] if the session was
    /// closed before the outcome arrived.
    pub async fn outcome(self) -> Result<Delivered<R>> {
        self.rx.await.map_err(|_| Error::Closed)
    }
}

/// Awaits every handle; results come back in handle order.
pub async fn collect<R>(handles: Vec<DeliveryHandle<R>>) -> Vec<Result<Delivered<R>>> {
    futures::future::join_all(handles.into_iter().map(DeliveryHandle::outcome)).await
}

pub(crate) struct InFlight<R> {
    key: String,
    record: Arc<R>,
    submitted_at: Instant,
    completion: Option<oneshot::Sender<Delivered<R>>>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    submitted: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    unmatched: AtomicU64,
}

/// A snapshot of a session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionStats {
    /// Calls to any submit method.
    pub submitted: u64,
    /// Submissions the transport took.
    pub accepted: u64,
    /// Submissions that never reached the transport.
    pub rejected: u64,
    /// Queue-full retries across all submissions.
    pub retries: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Reports that matched no pending submission.
    pub unmatched: u64,
    /// Accepted submissions without an outcome yet.
    pub pending: usize,
}

pub struct SessionBuilder<T, R> {
    transport: Arc<T>,
    reports: DeliveryReports,
    serializer: Arc<dyn RecordSerializer<R>>,
    handler: Arc<dyn DeliveryHandler<R>>,
    policy: BackpressurePolicy,
}

impl<T, R> SessionBuilder<T, R>
where
    T: Transport<R>,
    R: Send + Sync + 'static,
{
    pub fn handler(mut self, handler: impl DeliveryHandler<R>) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Spawns the delivery observer. Must be called inside a tokio runtime.
    pub fn start(self) -> ProducerSession<T, R> {
        let pending = Arc::new(PendingSet::new());
        let counters = Arc::new(Counters::default());
        let observer = DeliveryObserver::new(pending.clone(), counters.clone(), self.handler)
            .spawn(self.reports);

        info!(transport = %self.transport.name(), "Producer session started");

        ProducerSession {
            transport: self.transport,
            serializer: self.serializer,
            pending,
            counters,
            policy: self.policy,
            next_seq: AtomicU64::new(0),
            observer: Some(observer),
        }
    }
}

pub struct ProducerSession<T, R> {
    transport: Arc<T>,
    serializer: Arc<dyn RecordSerializer<R>>,
    pending: Arc<PendingSet<InFlight<R>>>,
    counters: Arc<Counters>,
    policy: BackpressurePolicy,
    next_seq: AtomicU64,
    observer: Option<JoinHandle<()>>,
}

impl<T, R> ProducerSession<T, R>
where
    T: Transport<R>,
    R: Send + Sync + 'static,
{
    /// `reports` must be the receiving half of the channel whose reporter
    /// `transport` was built with.
    pub fn builder(
        transport: Arc<T>,
        reports: DeliveryReports,
        serializer: Arc<dyn RecordSerializer<R>>,
    ) -> SessionBuilder<T, R> {
        SessionBuilder {
            transport,
            reports,
            serializer,
            handler: Arc::new(LoggingHandler),
            policy: BackpressurePolicy::default(),
        }
    }

    /// Submits `record` and returns its sequence number as soon as the
    /// transport has taken it. The outcome goes to the delivery handler.
    ///
    /// Errors are local only: serialization failure, an exhausted
    /// backpressure budget, or a submission the transport refused outright.
    pub async fn submit(
        &self,
        topic: &str,
        key: impl Into<String>,
        record: impl Into<Arc<R>>,
    ) -> Result<u64> {
        self.dispatch(topic, key.into(), record.into(), None).await
    }

    /// Like [`submit`](Self::submit), but also returns a handle to the outcome.
    pub async fn submit_tracked(
        &self,
        topic: &str,
        key: impl Into<String>,
        record: impl Into<Arc<R>>,
    ) -> Result<DeliveryHandle<R>> {
        let (tx, rx) = oneshot::channel();
        let seq = self
            .dispatch(topic, key.into(), record.into(), Some(tx))
            .await?;
        Ok(DeliveryHandle { seq, rx })
    }

    /// Submits `record` and waits for its own outcome.
    pub async fn submit_and_wait(
        &self,
        topic: &str,
        key: impl Into<String>,
        record: impl Into<Arc<R>>,
    ) -> Result<Delivered<R>> {
        self.submit_tracked(topic, key, record).await?.outcome().await
    }

    async fn dispatch(
        &self,
        topic: &str,
        key: String,
        record: Arc<R>,
        completion: Option<oneshot::Sender<Delivered<R>>>,
    ) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let payload = match self.serializer.serialize(&record) {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(seq, key = %key, "Serialization failed: {}", e);
                return Err(e);
            }
        };

        let registration = self.pending.track(
            seq,
            InFlight {
                key: key.clone(),
                record: record.clone(),
                submitted_at: Instant::now(),
                completion,
            },
        );

        let submission = Submission {
            seq,
            topic: topic.to_string(),
            key,
            record,
            payload,
        };

        match submit_with_backpressure(self.transport.as_ref(), submission, &self.policy).await {
            Ok(accepted) => {
                registration.accept();
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .retries
                    .fetch_add(u64::from(accepted.retries), Ordering::Relaxed);
                debug!(seq, retries = accepted.retries, "Submission handed to transport");
                Ok(seq)
            }
            Err(e) => {
                let key = registration
                    .abandon()
                    .map(|in_flight| in_flight.key)
                    .unwrap_or_default();
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(seq, key = %key, kind = %e.kind(), "Submission rejected locally: {}", e);
                Err(e)
            }
        }
    }

    /// Waits until every accepted submission has an outcome or `timeout`
    /// elapses. Returns how many are still unresolved; anything but zero
    /// means those messages may be lost.
    #[instrument(skip(self))]
    pub async fn drain(&self, timeout: Duration) -> usize {
        let unresolved = self.pending.wait_empty(timeout).await;
        if unresolved > 0 {
            warn!(
                unresolved,
                in_flight = self.transport.in_flight(),
                "Drain timed out with submissions still pending"
            );
        } else {
            debug!("All submissions resolved");
        }
        unresolved
    }

    /// Drains, then flushes and closes the transport with whatever time is
    /// left. Outcomes still missing after that are abandoned: their handles
    /// resolve to [`Error::Closed`]. The returned stats count them as
    /// `pending`.
    #[instrument(skip(self))]
    pub async fn close(mut self, timeout: Duration) -> Result<SessionStats> {
        let started = Instant::now();
        let unresolved = self.drain(timeout).await;

        let remaining = timeout.saturating_sub(started.elapsed());
        let transport = self.transport.clone();
        let closed = tokio::task::spawn_blocking(move || {
            <T as Transport<R>>::close(transport.as_ref(), remaining)
        })
        .await
        .map_err(|e| Error::Transport(TransportError::fatal(e.to_string())))?;

        self.shutdown_observer();
        let stats = self.stats();
        let abandoned = self.pending.clear().len();
        if abandoned > 0 {
            warn!(abandoned, "Abandoned submissions without an outcome");
        }

        info!(
            submitted = stats.submitted,
            accepted = stats.accepted,
            rejected = stats.rejected,
            succeeded = stats.succeeded,
            failed = stats.failed,
            unresolved = stats.pending,
            "Producer session closed"
        );

        closed.map(|()| stats)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            pending: self.pending.len(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

impl<T, R> ProducerSession<T, R> {
    fn shutdown_observer(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
    }
}

impl<T, R> Drop for ProducerSession<T, R> {
    fn drop(&mut self) {
        self.shutdown_observer();
    }
}
