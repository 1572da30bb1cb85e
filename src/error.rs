//! Error types and result handling for delivery-pipeline.
//!
//! This module defines the main error type [`Error`], the transport-level
//! [`TransportError`] with its [`ErrorKind`] classification, and a
//! convenience [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use delivery_pipeline::{Error, ErrorKind, Result, TransportError};
//!
//! fn submit() -> Result<()> {
//!     Err(TransportError::queue_full("local queue is saturated").into())
//! }
//!
//! match submit() {
//!     Ok(()) => println!("Submitted"),
//!     Err(e) if e.kind() == ErrorKind::QueueFull => eprintln!("Backing off: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a failed submission or delivery.
///
/// The backpressure controller only ever retries [`ErrorKind::QueueFull`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The transport's local buffer is saturated. Retryable after a wait.
    QueueFull,
    /// The request itself is unacceptable (too large, unknown topic, malformed).
    Rejected,
    /// The broker or network failed in a way that may succeed later.
    Transient,
    /// Anything else, including a closed transport.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// An error raised by a [`Transport`](crate::transport::Transport), either
/// synchronously on submission or asynchronously in a delivery report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn is_queue_full(&self) -> bool {
        self.kind == ErrorKind::QueueFull
    }
}

/// The main error type for delivery-pipeline operations.
///
/// Only [`Error::Config`] and [`Error::Kafka`] raised while opening the
/// transport are meant to stop the process; everything else is reported
/// per submission.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file, environment or validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka client error, typically while creating the producer.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding records.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Avro encoding error.
    #[error("Avro error: {0}")]
    Avro(String),

    /// Submission refused by the transport before hand-off.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The local queue stayed full for longer than the backpressure policy allows.
    #[error("Local queue still full after {attempts} attempts ({waited:?} waited)")]
    RetriesExhausted {
        /// Total submission attempts, including the first
        attempts: u32,
        /// Time spent waiting for queue space
        waited: Duration,
    },

    /// The session was closed before the outcome arrived.
    #[error("Producer session closed")]
    Closed,
}

impl Error {
    /// Classifies this error the same way transport errors are classified.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(e) => e.kind,
            Error::RetriesExhausted { .. } => ErrorKind::QueueFull,
            Error::Kafka(e) => crate::transport::kafka::classify(e),
            Error::Serialization(_) | Error::Avro(_) => ErrorKind::Rejected,
            Error::Config(_) | Error::Closed => ErrorKind::Fatal,
        }
    }
}

impl From<apache_avro::Error> for Error {
    fn from(e: apache_avro::Error) -> Self {
        Error::Avro(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// A convenient Result type alias for delivery-pipeline operations.
///
/// This is equivalent to `std::result::Result<T, delivery_pipeline::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
