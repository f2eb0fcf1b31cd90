//! Binary data encodings.
//!
//! Bincode is used both for values in the key/value storage engine and for
//! RPC payloads carried by the network transport. Log storage keys use a
//! hand-rolled order-preserving encoding in `raft::log`, since bincode's
//! variable-length integers don't sort lexicographically.

pub mod bincode;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Adds automatic Bincode encode/decode methods to value types. These are
/// used for values in the key/value storage engine, RPC messages, and other
/// encoded values.
pub trait Value: Serialize + DeserializeOwned {
    /// Decodes a value from a byte slice using Bincode.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Encodes a value to a byte vector using Bincode.
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }
}

/// Blanket implementations for types wrapping a value type.
impl<V: Value> Value for Option<V> {}
impl<V: Value> Value for Vec<V> {}
impl<V1: Value, V2: Value> Value for (V1, V2) {}
