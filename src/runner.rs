use crate::producer::{collect, ProducerMode, ProducerSession, SessionStats};
use crate::record::{record_key, UserRecord};
use crate::serializer::user_serializer;
use crate::transport::{delivery_channel, DeliveryReports, FakeTransport, KafkaTransport, Transport};
use crate::{Config, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Totals of one run of the submission loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub retries: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Accepted submissions still without an outcome when the run ended.
    pub unresolved: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    fn from_stats(stats: SessionStats, elapsed: Duration) -> Self {
        Self {
            submitted: stats.submitted,
            accepted: stats.accepted,
            rejected: stats.rejected,
            retries: stats.retries,
            succeeded: stats.succeeded,
            failed: stats.failed,
            unresolved: stats.pending,
            elapsed,
        }
    }

    /// True when nothing may have been lost on the way out.
    pub fn is_clean(&self) -> bool {
        self.unresolved == 0
    }
}

/// Produces `num_of_messages` user records to the configured topic.
pub struct Runner {
    config: Config,
}

impl Runner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs against Kafka. Failing to create the producer is the only error
    /// that ends the run early.
    pub async fn run(&self) -> Result<RunSummary> {
        let (reporter, reports) = delivery_channel();
        let transport = KafkaTransport::new(&self.config, reporter)?;
        self.run_on(Arc::new(transport), reports).await
    }

    /// Runs against an in-memory transport that accepts everything.
    pub async fn dry_run(&self) -> Result<RunSummary> {
        let (reporter, reports) = delivery_channel();
        self.run_on(Arc::new(FakeTransport::new(reporter)), reports)
            .await
    }

    pub async fn run_on<T>(&self, transport: Arc<T>, reports: DeliveryReports) -> Result<RunSummary>
    where
        T: Transport<UserRecord>,
    {
        let started = Instant::now();
        let producer = &self.config.producer;
        let serializer = user_serializer(producer.format, self.config.schema_id())?;

        info!(
            transport = %transport.name(),
            topic = %producer.topic,
            mode = ?producer.mode,
            messages = producer.num_of_messages,
            payload_size = producer.size_of_payload,
            "Producing"
        );

        let session = ProducerSession::builder(transport, reports, serializer)
            .policy(producer.backpressure_policy())
            .start();

        let mut handles = Vec::new();
        for index in 0..producer.num_of_messages {
            let record = UserRecord::for_index(index, producer.size_of_payload);
            let key = record_key(index);

            // Local failures were already reported by the session; keep going.
            match producer.mode {
                ProducerMode::Callback => {
                    if let Err(e) = session.submit(&producer.topic, key, record).await {
                        debug!(index, "Skipping record: {}", e);
                    }
                }
                ProducerMode::FireAndCollect => {
                    match session.submit_tracked(&producer.topic, key, record).await {
                        Ok(handle) => handles.push(handle),
                        Err(e) => debug!(index, "Skipping record: {}", e),
                    }
                }
                ProducerMode::Synchronous => {
                    if let Err(e) = session.submit_and_wait(&producer.topic, key, record).await {
                        debug!(index, "Skipping record: {}", e);
                    }
                }
            }
        }

        let flush_timeout = producer.flush_timeout();
        let drain_started = Instant::now();

        if !handles.is_empty() {
            let count = handles.len();
            match tokio::time::timeout(flush_timeout, collect(handles)).await {
                Ok(results) => {
                    let delivered = results
                        .iter()
                        .filter(|r| matches!(r, Ok(d) if d.outcome.is_success()))
                        .count();
                    info!(collected = count, delivered, "Collected delivery outcomes");
                }
                Err(_) => warn!(
                    handles = count,
                    "Timed out collecting delivery outcomes after {:?}", flush_timeout
                ),
            }
        }

        let remaining = flush_timeout.saturating_sub(drain_started.elapsed());
        let stats = session.close(remaining).await?;
        let summary = RunSummary::from_stats(stats, started.elapsed());

        if summary.is_clean() {
            info!(elapsed_ms = summary.elapsed.as_millis() as u64, "All messages resolved");
        } else {
            warn!(
                unresolved = summary.unresolved,
                "Messages still unresolved at shutdown, they may be lost"
            );
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KafkaConfig, ProducerConfig, SecurityProtocol};
    use crate::transport::fake::DeliveryMode;
    use crate::TransportError;

    fn create_test_config(mode: ProducerMode, messages: u64) -> Config {
        Config {
            kafka: KafkaConfig {
                brokers: vec!["localhost:9092".to_string()],
                security_protocol: SecurityProtocol::Plaintext,
                sasl_mechanism: "PLAIN".to_string(),
                sasl_username: None,
                sasl_password: None,
                acks: "all".to_string(),
                debug: None,
                compression: "none".to_string(),
                linger_ms: 0,
                batch_num_messages: 1,
                message_max_bytes: 1_000_000,
                batch_size: 1,
                queue_buffering_max_messages: 10,
                client_id: None,
            },
            producer: ProducerConfig {
                num_of_messages: messages,
                size_of_payload: 4,
                mode,
                queue_full_wait_ms: 1,
                queue_full_max_retries: 3,
                flush_timeout_secs: 5,
                ..ProducerConfig::default()
            },
            schema_registry: None,
        }
    }

    #[tokio::test]
    async fn test_dry_run_all_modes() {
        for mode in [
            ProducerMode::Callback,
            ProducerMode::FireAndCollect,
            ProducerMode::Synchronous,
        ] {
            let summary = Runner::new(create_test_config(mode, 5)).dry_run().await.unwrap();
            assert_eq!(summary.submitted, 5, "mode {:?}", mode);
            assert_eq!(summary.succeeded, 5, "mode {:?}", mode);
            assert!(summary.is_clean());
        }
    }

    #[tokio::test]
    async fn test_bad_record_does_not_abort_loop() {
        let (reporter, reports) = delivery_channel();
        let transport = Arc::new(
            FakeTransport::new(reporter)
                .reject(1, TransportError::rejected("Broker: Message size too large"), 1)
                .reject(2, TransportError::queue_full("Local: Queue full"), 10),
        );

        let runner = Runner::new(create_test_config(ProducerMode::Callback, 4));
        let summary = runner.run_on(transport.clone(), reports).await.unwrap();

        assert_eq!(summary.submitted, 4);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.retries, 0);
        // Queue-full submission was tried once plus three retries
        assert_eq!(transport.attempts_for(2), 4);
        assert_eq!(transport.attempts_for(3), 1);
        assert!(summary.is_clean());
    }

    #[tokio::test]
    async fn test_unresolved_reported() {
        let (reporter, reports) = delivery_channel();
        let transport = Arc::new(FakeTransport::new(reporter).with_mode(DeliveryMode::Held));

        let mut config = create_test_config(ProducerMode::Callback, 3);
        config.producer.flush_timeout_secs = 0;

        let summary = Runner::new(config).run_on(transport, reports).await.unwrap();
        assert_eq!(summary.unresolved, 3);
        assert!(!summary.is_clean());
    }
}
