//! A scriptable in-memory transport.
//!
//! Used by the test suites and by `--dry-run`. Every accepted submission gets
//! the next offset on partition 0; rejections and delivery failures can be
//! scripted per sequence number.

use super::{DeliveryReport, DeliveryReporter, Submission, Transport};
use crate::{Result, TransportError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Report from inside `submit`.
    Immediate,
    /// Keep reports until [`FakeTransport::release_all`] or friends.
    Held,
    /// Report from a tokio task after the delay.
    Delayed(Duration),
}

/// One call to `submit`, accepted or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub seq: u64,
    pub key: String,
    pub payload: Vec<u8>,
}

struct FakeState {
    mode: DeliveryMode,
    rejections: HashMap<u64, VecDeque<TransportError>>,
    always_reject: Option<TransportError>,
    delivery_failures: HashMap<u64, TransportError>,
    duplicate_reports: bool,
    held: Vec<DeliveryReport>,
    next_offset: i64,
    attempts: Vec<Attempt>,
    accepted: Vec<Attempt>,
    closed: bool,
}

pub struct FakeTransport {
    state: Mutex<FakeState>,
    reporter: DeliveryReporter,
}

impl FakeTransport {
    pub fn new(reporter: DeliveryReporter) -> Self {
        Self {
            state: Mutex::new(FakeState {
                mode: DeliveryMode::Immediate,
                rejections: HashMap::new(),
                always_reject: None,
                delivery_failures: HashMap::new(),
                duplicate_reports: false,
                held: Vec::new(),
                next_offset: 0,
                attempts: Vec::new(),
                accepted: Vec::new(),
                closed: false,
            }),
            reporter,
        }
    }

    pub fn with_mode(self, mode: DeliveryMode) -> Self {
        self.lock().mode = mode;
        self
    }

    /// Refuses the first `times` attempts of submission `seq` with `error`.
    pub fn reject(self, seq: u64, error: TransportError, times: usize) -> Self {
        self.lock()
            .rejections
            .entry(seq)
            .or_default()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    /// Refuses every attempt with `error`.
    pub fn reject_all(self, error: TransportError) -> Self {
        self.lock().always_reject = Some(error);
        self
    }

    /// Accepts submission `seq` but reports its delivery as failed.
    pub fn fail_delivery(self, seq: u64, error: TransportError) -> Self {
        self.lock().delivery_failures.insert(seq, error);
        self
    }

    /// Sends every delivery report twice.
    pub fn duplicate_reports(self) -> Self {
        self.lock().duplicate_reports = true;
        self
    }

    /// Reports every held delivery in acceptance order.
    pub fn release_all(&self) -> usize {
        let held: Vec<_> = self.lock().held.drain(..).collect();
        self.send_all(held)
    }

    /// Reports every held delivery, newest first.
    pub fn release_reversed(&self) -> usize {
        let mut held: Vec<_> = self.lock().held.drain(..).collect();
        held.reverse();
        self.send_all(held)
    }

    /// Reports the oldest `count` held deliveries.
    pub fn release(&self, count: usize) -> usize {
        let held: Vec<_> = {
            let mut state = self.lock();
            let count = count.min(state.held.len());
            state.held.drain(..count).collect()
        };
        self.send_all(held)
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.lock().attempts.clone()
    }

    pub fn attempts_for(&self, seq: u64) -> usize {
        self.lock().attempts.iter().filter(|a| a.seq == seq).count()
    }

    pub fn accepted(&self) -> Vec<Attempt> {
        self.lock().accepted.clone()
    }

    pub fn held(&self) -> usize {
        self.lock().held.len()
    }

    fn send_all(&self, reports: Vec<DeliveryReport>) -> usize {
        let count = reports.len();
        for report in reports {
            self.reporter.report(report);
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Send + Sync + 'static> Transport<R> for FakeTransport {
    fn submit(
        &self,
        submission: Submission<R>,
    ) -> std::result::Result<(), (TransportError, Submission<R>)> {
        let (report, mode, duplicate) = {
            let mut state = self.lock();
            let attempt = Attempt {
                seq: submission.seq,
                key: submission.key.clone(),
                payload: submission.payload.clone(),
            };
            state.attempts.push(attempt.clone());

            if state.closed {
                return Err((TransportError::fatal("transport is closed"), submission));
            }
            if let Some(error) = state.always_reject.clone() {
                return Err((error, submission));
            }
            if let Some(error) = state
                .rejections
                .get_mut(&submission.seq)
                .and_then(|queue| queue.pop_front())
            {
                debug!(seq = submission.seq, "Fake transport rejecting submission: {}", error);
                return Err((error, submission));
            }

            state.accepted.push(attempt);
            let report = match state.delivery_failures.remove(&submission.seq) {
                Some(error) => DeliveryReport::failed(submission.seq, error),
                None => {
                    let offset = state.next_offset;
                    state.next_offset += 1;
                    DeliveryReport::delivered(submission.seq, 0, offset)
                }
            };

            if state.mode == DeliveryMode::Held {
                if state.duplicate_reports {
                    state.held.push(report.clone());
                }
                state.held.push(report);
                return Ok(());
            }
            (report, state.mode, state.duplicate_reports)
        };

        let reports = if duplicate {
            vec![report.clone(), report]
        } else {
            vec![report]
        };

        match mode {
            DeliveryMode::Delayed(delay) => {
                let reporter = self.reporter.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for report in reports {
                        reporter.report(report);
                    }
                });
            }
            _ => {
                self.send_all(reports);
            }
        }
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.lock().held.len()
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn close(&self, _timeout: Duration) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}
