//! Transport selection from connection strings.

use crate::config::{BrokerConfig, DocumentStoreConfig, MEMORY_SCHEME};
use anyhow::{bail, Result};
use orbit_transport::{Broker, DocumentStore, MemoryBroker, MemoryDocumentStore};
use std::sync::Arc;
use tracing::info;

fn scheme(address: &str) -> &str {
    address.split_once("://").map_or(address, |(scheme, _)| scheme)
}

/// The document store named by the connection string.
///
/// # Errors
///
/// Returns an error for schemes no client is built in for.
pub fn document_store(config: &DocumentStoreConfig) -> Result<Arc<dyn DocumentStore>> {
    let Some(connection) = config.connection_string.as_deref() else {
        bail!("document_store.connection_string is required");
    };
    if !connection.starts_with(MEMORY_SCHEME) {
        bail!("Unsupported document store scheme: {}", scheme(connection));
    }
    info!("Using in-process document store ({})", connection);
    Ok(Arc::new(MemoryDocumentStore::new()))
}

/// The broker named by the broker list.
///
/// # Errors
///
/// Returns an error if any address uses a scheme no client is built in for.
pub fn broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    if let Some(address) = config.brokers.iter().find(|b| !b.starts_with(MEMORY_SCHEME)) {
        bail!("Unsupported broker scheme: {}", scheme(address));
    }
    info!(
        client_id = %config.client_id,
        brokers = ?config.brokers,
        "Using in-process broker"
    );
    Ok(Arc::new(MemoryBroker::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let config = DocumentStoreConfig {
            connection_string: Some("memory://local".into()),
            ..DocumentStoreConfig::default()
        };
        assert_eq!(document_store(&config).unwrap().name(), "memory");
    }

    #[test]
    fn test_unsupported_store_scheme() {
        let config = DocumentStoreConfig {
            connection_string: Some("mongodb://localhost:27017".into()),
            ..DocumentStoreConfig::default()
        };
        let err = document_store(&config).err().unwrap();
        assert_eq!(err.to_string(), "Unsupported document store scheme: mongodb");
    }

    #[test]
    fn test_unsupported_broker_scheme() {
        let config = BrokerConfig {
            brokers: vec!["memory://a".into(), "localhost:9092".into()],
            ..BrokerConfig::default()
        };
        let err = broker(&config).err().unwrap();
        assert_eq!(err.to_string(), "Unsupported broker scheme: localhost:9092");

        assert_eq!(broker(&BrokerConfig::default()).unwrap().name(), "memory");
    }
}
