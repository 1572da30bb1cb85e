pub mod config;
pub mod error;
pub mod pending;
pub mod producer;
pub mod record;
pub mod runner;
pub mod serializer;
pub mod transport;

pub use config::Config;
pub use error::{Error, ErrorKind, Result, TransportError};
pub use producer::{Delivered, DeliveryHandle, DeliveryOutcome, ProducerMode, ProducerSession};
pub use runner::{RunSummary, Runner};
