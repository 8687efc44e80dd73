//! In-process document store.

use crate::traits::{DocumentStore, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// A document store holding collections in process memory.
///
/// Collections are keyed by `database/collection`.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: DashMap<String, Vec<serde_json::Value>>,
    connected: AtomicBool,
    unreachable: bool,
    connect_delay: Option<Duration>,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `connect` always fails.
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Delay every `connect` call, for exercising connect timeouts.
    #[must_use]
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Insert a document.
    pub fn insert(&self, database: &str, collection: &str, document: serde_json::Value) {
        self.collections
            .entry(key(database, collection))
            .or_default()
            .push(document);
    }

    /// Check if the store is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

fn key(database: &str, collection: &str) -> String {
    format!("{database}/{collection}")
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn connect(&self) -> Result<(), TransportError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable {
            return Err(TransportError::ConnectFailed(
                "memory document store configured as unreachable".into(),
            ));
        }
        self.connected.store(true, Ordering::Release);
        info!("Connected to memory document store");
        Ok(())
    }

    async fn find_one(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Option<serde_json::Value>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(self
            .collections
            .get(&key(database, collection))
            .and_then(|docs| docs.first().cloned()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Err(TransportError::ConnectionClosed);
        }
        info!("Disconnected from memory document store");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_find_one() {
        let store = MemoryDocumentStore::new();
        store.insert("orbit", "stays", json!({"_id": "a1"}));
        store.insert("orbit", "stays", json!({"_id": "a2"}));
        store.connect().await.unwrap();

        let doc = store.find_one("orbit", "stays").await.unwrap();
        assert_eq!(doc, Some(json!({"_id": "a1"})));
        assert_eq!(store.find_one("orbit", "empty").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let store = MemoryDocumentStore::new();
        assert!(store.find_one("orbit", "stays").await.is_err());
        assert!(store.disconnect().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let store = MemoryDocumentStore::unreachable();
        assert!(store.connect().await.is_err());
        assert!(!store.is_connected());
    }
}
