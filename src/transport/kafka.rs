use super::{DeliveryReport, DeliveryReporter, Submission, Transport};
use crate::config::Config;
use crate::{Error, ErrorKind, Result, TransportError};
use rdkafka::client::ClientContext;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Routes librdkafka delivery callbacks into the delivery channel.
///
/// `delivery` runs on the producer's polling thread, once per message that
/// librdkafka accepted.
pub struct DeliveryContext {
    reporter: DeliveryReporter,
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<u64>;

    fn delivery(&self, result: &DeliveryResult<'_>, seq: Self::DeliveryOpaque) {
        let report = match result {
            Ok(message) => DeliveryReport::delivered(*seq, message.partition(), message.offset()),
            Err((error, _message)) => DeliveryReport::failed(
                *seq,
                TransportError::new(classify(error), error.to_string()),
            ),
        };

        if !self.reporter.report(report) {
            warn!(seq = *seq, "Delivery report dropped, observer is gone");
        }
    }
}

pub struct KafkaTransport {
    producer: ThreadedProducer<DeliveryContext>,
    name: String,
    closed: AtomicBool,
}

impl KafkaTransport {
    pub fn new(config: &Config, reporter: DeliveryReporter) -> Result<Self> {
        let producer: ThreadedProducer<DeliveryContext> = client_config(config)
            .create_with_context(DeliveryContext { reporter })
            .map_err(Error::Kafka)?;

        let name = unsafe {
            std::ffi::CStr::from_ptr(rdkafka::bindings::rd_kafka_name(
                producer.client().native_ptr(),
            ))
        }
        .to_string_lossy()
        .into_owned();
        info!(client = %name, brokers = %config.bootstrap_servers(), "Kafka producer created");

        Ok(Self {
            producer,
            name,
            closed: AtomicBool::new(false),
        })
    }
}

/// Maps the typed configuration onto librdkafka properties.
pub fn client_config(config: &Config) -> ClientConfig {
    let kafka = &config.kafka;
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("security.protocol", kafka.security_protocol.as_str())
        .set("acks", &kafka.acks)
        .set("compression.type", &kafka.compression)
        .set("linger.ms", kafka.linger_ms.to_string())
        .set("batch.num.messages", kafka.batch_num_messages.to_string())
        .set("message.max.bytes", kafka.message_max_bytes.to_string())
        .set("batch.size", kafka.batch_size.to_string())
        .set(
            "queue.buffering.max.messages",
            kafka.queue_buffering_max_messages.to_string(),
        );

    if kafka.security_protocol.uses_sasl() {
        client_config.set("sasl.mechanism", &kafka.sasl_mechanism);
        if let Some(username) = &kafka.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(password) = &kafka.sasl_password {
            client_config.set("sasl.password", password);
        }
    }

    if let Some(debug) = kafka.debug.as_deref().filter(|d| !d.is_empty()) {
        client_config.set("debug", debug);
    }

    if let Some(client_id) = &kafka.client_id {
        client_config.set("client.id", client_id);
    }

    client_config
}

/// Classifies a librdkafka error for the backpressure controller and the
/// delivery observer.
pub fn classify(error: &KafkaError) -> ErrorKind {
    use RDKafkaErrorCode::*;

    match error.rdkafka_error_code() {
        Some(QueueFull) => ErrorKind::QueueFull,
        Some(
            MessageSizeTooLarge
            | InvalidMessage
            | InvalidMessageSize
            | BadMessage
            | UnknownTopic
            | UnknownTopicOrPartition
            | UnknownPartition
            | TopicAuthorizationFailed,
        ) => ErrorKind::Rejected,
        Some(
            MessageTimedOut
            | RequestTimedOut
            | NetworkException
            | NotLeaderForPartition
            | LeaderNotAvailable
            | NotEnoughReplicas
            | NotEnoughReplicasAfterAppend
            | BrokerTransportFailure
            | AllBrokersDown,
        ) => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

impl<R: Send + Sync + 'static> Transport<R> for KafkaTransport {
    fn submit(
        &self,
        submission: Submission<R>,
    ) -> std::result::Result<(), (TransportError, Submission<R>)> {
        if self.closed.load(Ordering::Acquire) {
            return Err((TransportError::fatal("transport is closed"), submission));
        }

        let sent = {
            let record: BaseRecord<'_, str, [u8], Box<u64>> =
                BaseRecord::with_opaque_to(submission.topic.as_str(), Box::new(submission.seq))
                    .key(submission.key.as_str())
                    .payload(submission.payload.as_slice());
            self.producer.send(record).map_err(|(error, _record)| error)
        };

        match sent {
            Ok(()) => Ok(()),
            Err(error) => {
                let kind = classify(&error);
                debug!(seq = submission.seq, %kind, "Kafka refused submission: {}", error);
                Err((TransportError::new(kind, error.to_string()), submission))
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.producer.in_flight_count().max(0) as usize
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout).map_err(Error::Kafka)
    }

    fn close(&self, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = <Self as Transport<R>>::flush(self, timeout);
        info!(client = %self.name, "Kafka producer closed");
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}
