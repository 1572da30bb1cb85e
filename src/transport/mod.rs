//! The transport seam between the producer session and the broker client.
//!
//! A [`Transport`] accepts [`Submission`]s without blocking and later reports
//! exactly one [`DeliveryReport`] per accepted submission through the
//! [`DeliveryReporter`] it was built with. Reports are consumed by the
//! session's delivery observer on the other end of [`delivery_channel`].

pub mod fake;
pub mod kafka;

use crate::{Result, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use fake::FakeTransport;
pub use kafka::KafkaTransport;

/// One record, already serialized, addressed to a topic under a key.
///
/// Handed back unchanged by [`Transport::submit`] on rejection, so a retry
/// sends exactly the same key and payload.
#[derive(Debug, Clone)]
pub struct Submission<R> {
    pub seq: u64,
    pub topic: String,
    pub key: String,
    pub record: Arc<R>,
    pub payload: Vec<u8>,
}

/// Where an accepted submission ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPosition {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub seq: u64,
    pub result: std::result::Result<DeliveryPosition, TransportError>,
}

impl DeliveryReport {
    pub fn delivered(seq: u64, partition: i32, offset: i64) -> Self {
        Self {
            seq,
            result: Ok(DeliveryPosition { partition, offset }),
        }
    }

    pub fn failed(seq: u64, error: TransportError) -> Self {
        Self {
            seq,
            result: Err(error),
        }
    }
}

/// Sending half of the delivery channel, owned by a transport.
///
/// Safe to call from any thread, including librdkafka's polling thread.
#[derive(Debug, Clone)]
pub struct DeliveryReporter {
    tx: mpsc::UnboundedSender<DeliveryReport>,
}

impl DeliveryReporter {
    /// Returns false once the observer has gone away.
    pub fn report(&self, report: DeliveryReport) -> bool {
        self.tx.send(report).is_ok()
    }
}

/// Receiving half of the delivery channel, consumed by the delivery observer.
#[derive(Debug)]
pub struct DeliveryReports {
    rx: mpsc::UnboundedReceiver<DeliveryReport>,
}

impl DeliveryReports {
    pub async fn recv(&mut self) -> Option<DeliveryReport> {
        self.rx.recv().await
    }
}

pub fn delivery_channel() -> (DeliveryReporter, DeliveryReports) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliveryReporter { tx }, DeliveryReports { rx })
}

/// A broker client able to transmit submissions in the background.
pub trait Transport<R>: Send + Sync + 'static {
    /// Enqueues a submission for background delivery without blocking.
    ///
    /// Errors are local conditions detected before hand-off; the submission
    /// is returned so it can be retried verbatim. Broker-side failures are
    /// never returned here, only reported through the delivery channel.
    fn submit(
        &self,
        submission: Submission<R>,
    ) -> std::result::Result<(), (TransportError, Submission<R>)>;

    /// Number of submissions the transport still holds.
    fn in_flight(&self) -> usize;

    /// Blocks until queued submissions have been transmitted or `timeout` elapses.
    fn flush(&self, timeout: Duration) -> Result<()>;

    /// Flushes and releases the transport; later submissions fail as fatal.
    fn close(&self, timeout: Duration) -> Result<()>;

    fn name(&self) -> &str;
}
