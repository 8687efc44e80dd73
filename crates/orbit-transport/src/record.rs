//! Broker record type.

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// A record read from, or appended to, a broker topic.
#[derive(Debug, Clone)]
pub struct Record {
    /// Topic the record belongs to.
    pub topic: String,
    /// Position of the record within its topic.
    pub offset: u64,
    /// Optional partitioning key.
    pub key: Option<Bytes>,
    /// Record payload.
    pub value: Bytes,
    /// Append time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Record {
    /// Create a new record at `offset`.
    #[must_use]
    pub fn new(topic: impl Into<String>, offset: u64, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            offset,
            key: None,
            value: value.into(),
            timestamp: now_millis(),
        }
    }

    /// Attach a partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// The payload as UTF-8, lossily decoded for logging.
    #[must_use]
    pub fn value_lossy(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
