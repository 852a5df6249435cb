//! Session metadata.
//!
//! Metadata stamped onto a session at authorization flows out with every
//! upstream gRPC call, so backend services can see who they are serving
//! without re-authenticating.

use std::collections::HashMap;

use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tracing::debug;

/// Metadata key carrying the session id on upstream calls.
pub const MD_SESSION_ID: &str = "session-id";
/// Metadata key carrying the gateway node id on upstream calls.
pub const MD_GATEWAY_ID: &str = "gateway-id";
/// Metadata key carrying the per-request transaction id.
pub const MD_TRANSACTION_ID: &str = "transaction-id";

/// Key → list-of-values map, gRPC metadata shaped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: HashMap<String, Vec<String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value under the key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values under the key.
    pub fn values(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replaces the values under the key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), vec![value.into()]);
    }

    /// Appends a value under the key.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(key.into()).or_default().push(value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Converts to tonic metadata for an outgoing call.
    ///
    /// Entries with keys or values gRPC cannot carry are skipped with a
    /// debug log rather than failing the request.
    pub fn to_tonic(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        for (key, values) in &self.entries {
            let Ok(key) = MetadataKey::from_bytes(key.as_bytes()) else {
                debug!(key, "skipping metadata entry with invalid key");
                continue;
            };
            for value in values {
                match MetadataValue::try_from(value.as_str()) {
                    Ok(value) => {
                        map.append(key.clone(), value);
                    }
                    Err(_) => debug!(%key, "skipping metadata entry with invalid value"),
                }
            }
        }
        map
    }
}
