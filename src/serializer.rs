use crate::record::UserRecord;
use crate::Result;
use apache_avro::types::Value as AvroValue;
use apache_avro::Schema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Converts a typed record into the bytes handed to the transport.
///
/// A failure is fatal for that one record only; the caller reports it and
/// moves on to the next submission.
pub trait RecordSerializer<R>: Send + Sync {
    fn serialize(&self, record: &R) -> Result<Vec<u8>>;

    fn format(&self) -> SerializationFormat;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    #[default]
    Json,
    JsonPretty,
    Avro,
}

pub struct JsonSerializer {
    format: SerializationFormat,
}

impl JsonSerializer {
    pub fn new(format: SerializationFormat) -> Self {
        let format = match format {
            SerializationFormat::JsonPretty => SerializationFormat::JsonPretty,
            _ => SerializationFormat::Json,
        };
        Self { format }
    }

    pub fn compact() -> Self {
        Self::new(SerializationFormat::Json)
    }
}

impl<R: Serialize> RecordSerializer<R> for JsonSerializer {
    fn serialize(&self, record: &R) -> Result<Vec<u8>> {
        let bytes = match self.format {
            SerializationFormat::JsonPretty => serde_json::to_vec_pretty(record)?,
            _ => serde_json::to_vec(record)?,
        };
        Ok(bytes)
    }

    fn format(&self) -> SerializationFormat {
        self.format
    }
}

pub const USER_SCHEMA: &str = r#"{
    "type": "record",
    "name": "User",
    "namespace": "io.deliverypipeline",
    "fields": [
        {"name": "name", "type": "string"},
        {"name": "favorite_color", "type": "string"},
        {"name": "favorite_number", "type": "long"},
        {
            "name": "hourly_rate",
            "type": {"type": "bytes", "logicalType": "decimal", "precision": 10, "scale": 2}
        }
    ]
}"#;

const CONFLUENT_MAGIC_BYTE: u8 = 0;

/// Avro datum encoder for [`UserRecord`].
///
/// With a schema id the datum is framed in the Confluent wire format:
/// `[0x00][schema id, 4 bytes big-endian][datum]`.
pub struct AvroSerializer {
    schema: Schema,
    schema_id: Option<u32>,
}

impl AvroSerializer {
    pub fn new(schema_id: Option<u32>) -> Result<Self> {
        let schema = Schema::parse_str(USER_SCHEMA)?;
        Ok(Self { schema, schema_id })
    }

    fn to_value(record: &UserRecord) -> AvroValue {
        AvroValue::Record(vec![
            ("name".to_string(), AvroValue::String(record.name.clone())),
            (
                "favorite_color".to_string(),
                AvroValue::String(record.favorite_color.clone()),
            ),
            (
                "favorite_number".to_string(),
                AvroValue::Long(record.favorite_number),
            ),
            (
                "hourly_rate".to_string(),
                AvroValue::Decimal(apache_avro::Decimal::from(record.hourly_rate.to_be_bytes())),
            ),
        ])
    }
}

impl RecordSerializer<UserRecord> for AvroSerializer {
    fn serialize(&self, record: &UserRecord) -> Result<Vec<u8>> {
        let datum = apache_avro::to_avro_datum(&self.schema, Self::to_value(record))?;

        match self.schema_id {
            Some(id) => {
                let mut framed = Vec::with_capacity(datum.len() + 5);
                framed.push(CONFLUENT_MAGIC_BYTE);
                framed.extend_from_slice(&id.to_be_bytes());
                framed.extend_from_slice(&datum);
                Ok(framed)
            }
            None => Ok(datum),
        }
    }

    fn format(&self) -> SerializationFormat {
        SerializationFormat::Avro
    }
}

pub fn user_serializer(
    format: SerializationFormat,
    schema_id: Option<u32>,
) -> Result<Arc<dyn RecordSerializer<UserRecord>>> {
    match format {
        SerializationFormat::Avro => Ok(Arc::new(AvroSerializer::new(schema_id)?)),
        other => Ok(Arc::new(JsonSerializer::new(other))),
    }
}
