//! The routes this server exposes.

pub mod countries;
pub mod notify_worker;
pub mod states;

use orbit_core::{RegistryError, RouteRegistry};

/// Build the registry, in binding order.
///
/// # Errors
///
/// Returns an error if two routes share an id.
pub fn registry() -> Result<RouteRegistry, RegistryError> {
    let mut registry = RouteRegistry::new();
    registry
        .register(countries::route())?
        .register(states::route())?
        .register(notify_worker::route())?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_core::{Orchestrator, ServiceConfig};
    use orbit_transport::{MemoryBroker, MemoryDocumentStore};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_registry_order() {
        let registry = registry().unwrap();
        let ids: Vec<_> = registry.descriptors().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec![countries::ID, states::ID, notify_worker::ID]);
    }

    #[tokio::test]
    async fn test_routes_served() {
        let broker = MemoryBroker::new();
        let service = Orchestrator::new(
            ServiceConfig {
                listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                idle_interval: None,
                ..ServiceConfig::default()
            },
            registry().unwrap(),
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(broker.clone()),
        )
        .start()
        .await
        .unwrap();
        let base = format!("http://{}", service.local_addr());

        let countries = reqwest::get(format!("{base}{}", countries::PATH)).await.unwrap();
        assert_eq!(countries.status().as_u16(), 200);
        assert_eq!(countries.text().await.unwrap(), r#"["india","usa","uk"]"#);

        let states = reqwest::get(format!("{base}{}", states::PATH)).await.unwrap();
        assert_eq!(
            states.text().await.unwrap(),
            r#"["Tamil Nadu","Kerala","Andra Pradesh"]"#
        );

        broker.publish(notify_worker::INPUT_TOPIC, "job-7").unwrap();
        let mut notified = Vec::new();
        for _ in 0..300 {
            notified = broker.records(notify_worker::OUTPUT_TOPIC);
            if !notified.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].value_lossy(), "Worker notified: job-7");

        assert_eq!(service.shutdown().await.exit_code(), 0);
    }
}
