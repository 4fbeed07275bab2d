//! Human-readable byte quantities used by the cache configuration
//!
//! Accepts plain integers (bytes) or strings such as `"50M"`, `"1.5G"`,
//! `"512KiB"`. All suffixes are binary multiples: `"1M"` is 1,048,576 bytes.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// A byte count parsed from a human-readable quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Exact number of bytes
    pub const fn b(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Kibibytes
    pub const fn kib(n: u64) -> Self {
        Self(n * KIB)
    }

    /// Mebibytes
    pub const fn mib(n: u64) -> Self {
        Self(n * MIB)
    }

    /// Gibibytes
    pub const fn gib(n: u64) -> Self {
        Self(n * GIB)
    }

    /// Size in bytes
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    fn multiplier(unit: &str) -> Option<u64> {
        match unit.to_ascii_lowercase().as_str() {
            "" | "b" => Some(1),
            "k" | "kb" | "kib" => Some(KIB),
            "m" | "mb" | "mib" => Some(MIB),
            "g" | "gb" | "gib" => Some(GIB),
            "t" | "tb" | "tib" => Some(TIB),
            _ => None,
        }
    }
}

impl FromStr for ByteSize {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        if number.is_empty() {
            return Err(CacheError::InvalidSize(s.to_string()));
        }

        let multiplier =
            Self::multiplier(unit.trim()).ok_or_else(|| CacheError::InvalidSize(s.to_string()))?;

        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(multiplier)
                .map(Self)
                .ok_or_else(|| CacheError::InvalidSize(s.to_string()));
        }

        let fractional: f64 = number
            .parse()
            .map_err(|_| CacheError::InvalidSize(s.to_string()))?;
        let bytes = fractional * multiplier as f64;
        if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
            return Err(CacheError::InvalidSize(s.to_string()));
        }
        Ok(Self(bytes.round() as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        for (unit, size) in [("T", TIB), ("G", GIB), ("M", MIB), ("K", KIB)] {
            if bytes >= size && bytes % size == 0 {
                return write!(f, "{}{}", bytes / size, unit);
            }
        }
        write!(f, "{}", bytes)
    }
}

impl From<u64> for ByteSize {
    fn from(bytes: u64) -> Self {
        Self(bytes)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(bytes) => Ok(Self(bytes)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}
