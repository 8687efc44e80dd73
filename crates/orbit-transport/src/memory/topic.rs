//! Topic log for the in-process broker.
//!
//! A topic is an append-only record log plus the read position of every
//! consumer group that subscribed to it.

use crate::record::Record;
use crate::traits::StartOffset;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 249;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if name == "." || name == ".." {
        return Err("Topic name cannot be '.' or '..'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err("Topic name contains invalid characters");
    }
    Ok(())
}

/// An append-only topic log.
#[derive(Debug)]
pub struct TopicLog {
    name: String,
    records: Vec<Record>,
    /// Next offset to read, per consumer group.
    offsets: HashMap<String, usize>,
    appended: Arc<Notify>,
}

impl TopicLog {
    /// Create an empty topic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
            offsets: HashMap::new(),
            appended: Arc::new(Notify::new()),
        }
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of records retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the topic has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Notifier fired on every append.
    #[must_use]
    pub fn appended(&self) -> Arc<Notify> {
        Arc::clone(&self.appended)
    }

    /// Register a consumer group. Existing groups keep their position.
    pub fn join(&mut self, group_id: &str, start: StartOffset) {
        let end = self.records.len();
        self.offsets.entry(group_id.to_string()).or_insert_with(|| {
            debug!(topic = %self.name, group = %group_id, ?start, "Group joined topic");
            match start {
                StartOffset::Earliest => 0,
                StartOffset::Latest => end,
            }
        });
    }

    /// Append a payload, returning its offset.
    pub fn append(&mut self, value: Bytes) -> u64 {
        let offset = self.records.len() as u64;
        self.records.push(Record::new(self.name.clone(), offset, value));
        trace!(topic = %self.name, offset, "Appended record");
        self.appended.notify_waiters();
        offset
    }

    /// Take the next unread record for `group_id`, advancing its position.
    pub fn poll(&mut self, group_id: &str) -> Option<Record> {
        let position = self.offsets.get_mut(group_id)?;
        let record = self.records.get(*position)?.clone();
        *position += 1;
        Some(record)
    }

    /// Snapshot of every retained record.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.records.clone()
    }
}
