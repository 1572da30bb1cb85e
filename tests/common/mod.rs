#![allow(dead_code)]

use delivery_pipeline::producer::{BackpressurePolicy, Delivered, ProducerSession};
use delivery_pipeline::record::UserRecord;
use delivery_pipeline::serializer::{JsonSerializer, RecordSerializer, SerializationFormat};
use delivery_pipeline::transport::{delivery_channel, FakeTransport};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Outcomes = Arc<Mutex<Vec<Delivered<UserRecord>>>>;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("delivery_pipeline=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// A policy that retries quickly so tests stay fast.
pub fn fast_policy() -> BackpressurePolicy {
    BackpressurePolicy {
        wait: Duration::from_millis(2),
        max_retries: Some(10),
        deadline: None,
    }
}

/// Starts a session over a fake transport shaped by `configure`, recording
/// every outcome the delivery handler sees.
pub fn start_session(
    configure: impl FnOnce(FakeTransport) -> FakeTransport,
) -> (
    ProducerSession<FakeTransport, UserRecord>,
    Arc<FakeTransport>,
    Outcomes,
) {
    start_session_with(configure, Arc::new(JsonSerializer::compact()))
}

/// Like [`start_session`], with a caller-supplied serializer.
pub fn start_session_with(
    configure: impl FnOnce(FakeTransport) -> FakeTransport,
    serializer: Arc<dyn RecordSerializer<UserRecord>>,
) -> (
    ProducerSession<FakeTransport, UserRecord>,
    Arc<FakeTransport>,
    Outcomes,
) {
    init_tracing();

    let (reporter, reports) = delivery_channel();
    let transport = Arc::new(configure(FakeTransport::new(reporter)));
    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();

    let session = ProducerSession::builder(transport.clone(), reports, serializer)
        .policy(fast_policy())
        .handler(move |delivered: &Delivered<UserRecord>| {
            sink.lock().unwrap().push(delivered.clone());
        })
        .start();

    (session, transport, outcomes)
}

/// Serializes as compact JSON, except for records named `fail_on`.
pub struct FailingSerializer {
    pub fail_on: String,
}

impl RecordSerializer<UserRecord> for FailingSerializer {
    fn serialize(&self, record: &UserRecord) -> delivery_pipeline::Result<Vec<u8>> {
        if record.name == self.fail_on {
            return Err(delivery_pipeline::Error::Avro(format!(
                "cannot encode {}",
                record.name
            )));
        }
        JsonSerializer::compact().serialize(record)
    }

    fn format(&self) -> SerializationFormat {
        SerializationFormat::Json
    }
}
