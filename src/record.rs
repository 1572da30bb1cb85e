//! Application records produced by the pipeline.
//!
//! [`UserRecord::for_index`] builds the record for one iteration of the
//! submission loop; [`record_key`] builds its message key.

use serde::{Serialize, Serializer};
use std::fmt;

/// A fixed-point decimal: `unscaled * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    unscaled: i128,
    scale: u32,
}

impl Decimal {
    pub const fn new(unscaled: i128, scale: u32) -> Self {
        Self { unscaled, scale }
    }

    pub fn unscaled(&self) -> i128 {
        self.unscaled
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Minimal big-endian two's-complement encoding of the unscaled value,
    /// as used by the Avro `decimal` logical type.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        let bytes = self.unscaled.to_be_bytes();
        let negative = self.unscaled < 0;
        let filler = if negative { 0xff } else { 0x00 };

        let mut start = 0;
        while start < bytes.len() - 1
            && bytes[start] == filler
            && ((bytes[start + 1] & 0x80 != 0) == negative)
        {
            start += 1;
        }
        bytes[start..].to_vec()
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }
        let divisor = 10i128.pow(self.scale);
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let abs = self.unscaled.unsigned_abs();
        let divisor = divisor.unsigned_abs();
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            abs / divisor,
            abs % divisor,
            width = self.scale as usize
        )
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The user record every message carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub name: String,
    pub favorite_color: String,
    pub favorite_number: i64,
    pub hourly_rate: Decimal,
}

pub const DEFAULT_HOURLY_RATE: Decimal = Decimal::new(6799, 2);

impl UserRecord {
    /// Builds the record for loop iteration `index`, padding `favorite_color`
    /// to `payload_size` bytes.
    pub fn for_index(index: u64, payload_size: usize) -> Self {
        Self {
            name: format!("user:{}", index),
            favorite_color: "g".repeat(payload_size),
            favorite_number: index as i64 + 2,
            hourly_rate: DEFAULT_HOURLY_RATE,
        }
    }
}

pub fn record_key(index: u64) -> String {
    format!("user-{}", index)
}
