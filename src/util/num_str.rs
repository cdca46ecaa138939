//! Decimal-string serde adapters for wire integers.
//!
//! Accumulated amounts and nonces travel as stringified decimal integers to
//! avoid precision loss in JSON, matching the reference envelope codec.

/// Serde adapter for `U256` fields serialized as decimal strings.
pub mod u256_dec {
    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<U256>()
            .map_err(|_| Error::custom("amount must be a non-negative decimal integer"))
    }
}

/// Serde adapter for `u64` fields serialized as decimal strings.
pub mod u64_dec {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>()
            .map_err(|_| Error::custom("value must be a non-negative integer"))
    }
}
