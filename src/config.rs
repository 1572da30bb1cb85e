use crate::producer::{BackpressurePolicy, ProducerMode};
use crate::serializer::SerializationFormat;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub schema_registry: Option<SchemaRegistryConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default = "default_sasl_mechanism")]
    pub sasl_mechanism: String,
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default)]
    pub debug: Option<String>,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_batch_num_messages")]
    pub batch_num_messages: u32,
    #[serde(default = "default_message_max_bytes")]
    pub message_max_bytes: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_queue_buffering_max_messages")]
    pub queue_buffering_max_messages: u32,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    pub fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_num_of_messages")]
    pub num_of_messages: u64,
    #[serde(default = "default_size_of_payload")]
    pub size_of_payload: usize,
    #[serde(default)]
    pub mode: ProducerMode,
    #[serde(default)]
    pub format: SerializationFormat,
    #[serde(default = "default_queue_full_wait_ms")]
    pub queue_full_wait_ms: u64,
    /// Always bounded here; unbounded retrying is only available through
    /// [`BackpressurePolicy::unbounded`].
    #[serde(default = "default_queue_full_max_retries")]
    pub queue_full_max_retries: u32,
    #[serde(default)]
    pub queue_full_deadline_secs: Option<u64>,
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
}

/// Schema id written into the Confluent header; the registry itself is
/// never contacted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaRegistryConfig {
    #[serde(default)]
    pub schema_id: Option<u32>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            num_of_messages: default_num_of_messages(),
            size_of_payload: default_size_of_payload(),
            mode: ProducerMode::default(),
            format: SerializationFormat::default(),
            queue_full_wait_ms: default_queue_full_wait_ms(),
            queue_full_max_retries: default_queue_full_max_retries(),
            queue_full_deadline_secs: None,
            flush_timeout_secs: default_flush_timeout_secs(),
        }
    }
}

impl ProducerConfig {
    pub fn backpressure_policy(&self) -> BackpressurePolicy {
        BackpressurePolicy {
            wait: Duration::from_millis(self.queue_full_wait_ms),
            max_retries: Some(self.queue_full_max_retries),
            deadline: self.queue_full_deadline_secs.map(Duration::from_secs),
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("DELIVERY_PIPELINE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }

        if self.kafka.security_protocol.uses_sasl()
            && (self.kafka.sasl_username.is_none() || self.kafka.sasl_password.is_none())
        {
            return Err(Error::Config(format!(
                "security protocol {} requires sasl_username and sasl_password",
                self.kafka.security_protocol.as_str()
            )));
        }

        if self.producer.topic.is_empty() {
            return Err(Error::Config("producer.topic must not be empty".to_string()));
        }

        if self.producer.queue_full_wait_ms == 0 {
            return Err(Error::Config(
                "producer.queue_full_wait_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn bootstrap_servers(&self) -> String {
        self.kafka
            .brokers
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn schema_id(&self) -> Option<u32> {
        self.schema_registry.as_ref().and_then(|sr| sr.schema_id)
    }
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_linger_ms() -> u32 {
    100
}

fn default_batch_num_messages() -> u32 {
    10_000
}

fn default_message_max_bytes() -> u32 {
    1_000_000
}

fn default_batch_size() -> u32 {
    16384
}

fn default_queue_buffering_max_messages() -> u32 {
    100_000
}

fn default_topic() -> String {
    "raw.inventory".to_string()
}

fn default_num_of_messages() -> u64 {
    10
}

fn default_size_of_payload() -> usize {
    10
}

fn default_queue_full_wait_ms() -> u64 {
    2000
}

fn default_queue_full_max_retries() -> u32 {
    30
}

fn default_flush_timeout_secs() -> u64 {
    100
}
