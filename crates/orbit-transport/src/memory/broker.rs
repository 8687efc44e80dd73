//! In-process event broker.
//!
//! Topics live in a concurrent map; consumers in the same group share a read
//! position, so each record is delivered once per group.

use super::topic::{validate_topic_name, TopicLog};
use crate::record::Record;
use crate::traits::{
    AdminHandle, Broker, ConsumerHandle, ProducerHandle, StartOffset, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// In-process broker configuration.
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Maximum number of topics.
    pub max_topics: usize,
    /// Whether consumers and producers may create topics implicitly.
    pub auto_create_topics: bool,
    /// Refuse to connect, for exercising startup failure paths.
    pub unreachable: bool,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_topics: 10_000,
            auto_create_topics: true,
            unreachable: false,
        }
    }
}

struct BrokerState {
    topics: DashMap<String, TopicLog>,
    connected: AtomicBool,
    /// Wakes every blocked consumer when the broker goes away.
    closed: Notify,
    config: MemoryBrokerConfig,
}

impl BrokerState {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }

    fn ensure_topic(&self, topic: &str) -> Result<(), TransportError> {
        validate_topic_name(topic).map_err(|e| TransportError::Other(e.to_string()))?;
        if self.topics.contains_key(topic) {
            return Ok(());
        }
        if !self.config.auto_create_topics {
            return Err(TransportError::Other(format!("Unknown topic: {topic}")));
        }
        if self.topics.len() >= self.config.max_topics {
            return Err(TransportError::Other("Maximum topics reached".into()));
        }
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic = %topic, "Creating new topic");
            TopicLog::new(topic)
        });
        Ok(())
    }

    fn append(&self, topic: &str, payload: Bytes) -> Result<u64, TransportError> {
        self.ensure_topic(topic)?;
        let mut entry = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::Other(format!("Unknown topic: {topic}")))?;
        Ok(entry.append(payload))
    }
}

/// An event broker that keeps every topic in process memory.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create a new broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryBrokerConfig::default())
    }

    /// Create a new broker with custom configuration.
    #[must_use]
    pub fn with_config(config: MemoryBrokerConfig) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: DashMap::new(),
                connected: AtomicBool::new(false),
                closed: Notify::new(),
                config,
            }),
        }
    }

    /// A broker whose `connect` always fails.
    #[must_use]
    pub fn unreachable() -> Self {
        Self::with_config(MemoryBrokerConfig {
            unreachable: true,
            ..MemoryBrokerConfig::default()
        })
    }

    /// Append a payload to `topic` directly, as an external producer would.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is not connected or the topic is invalid.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<u64, TransportError> {
        self.state.ensure_connected()?;
        self.state.append(topic, payload.into())
    }

    /// Snapshot of the records in `topic`.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.state
            .topics
            .get(topic)
            .map(|t| t.records())
            .unwrap_or_default()
    }

    /// Check if a topic exists.
    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state.topics.contains_key(topic)
    }

    /// Check if the broker is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.state.config.unreachable {
            return Err(TransportError::ConnectFailed(
                "memory broker configured as unreachable".into(),
            ));
        }
        self.state.connected.store(true, Ordering::Release);
        info!("Connected to memory broker");
        Ok(())
    }

    async fn admin(&self) -> Result<Box<dyn AdminHandle>, TransportError> {
        self.state.ensure_connected()?;
        Ok(Box::new(MemoryAdmin {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }

    async fn consumer(
        &self,
        group_id: &str,
        topic: &str,
        start: StartOffset,
    ) -> Result<Box<dyn ConsumerHandle>, TransportError> {
        self.state.ensure_connected()?;
        self.state.ensure_topic(topic)?;
        let appended = {
            let mut entry = self
                .state
                .topics
                .get_mut(topic)
                .ok_or_else(|| TransportError::Other(format!("Unknown topic: {topic}")))?;
            entry.join(group_id, start);
            entry.appended()
        };
        Ok(Box::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            appended,
            open: true,
        }))
    }

    async fn producer(&self) -> Result<Arc<dyn ProducerHandle>, TransportError> {
        self.state.ensure_connected()?;
        Ok(Arc::new(MemoryProducer {
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.state.connected.swap(false, Ordering::AcqRel) {
            warn!("Memory broker disconnect requested while not connected");
            return Ok(());
        }
        self.state.closed.notify_waiters();
        for topic in self.state.topics.iter() {
            topic.appended().notify_waiters();
        }
        info!("Disconnected from memory broker");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryAdmin {
    state: Arc<BrokerState>,
    open: bool,
}

#[async_trait]
impl AdminHandle for MemoryAdmin {
    async fn list_topics(&self) -> Result<Vec<String>, TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.state.ensure_connected()?;
        Ok(self.state.topics.iter().map(|t| t.key().clone()).collect())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<BrokerState>,
    group_id: String,
    topic: String,
    appended: Arc<Notify>,
    open: bool,
}

#[async_trait]
impl ConsumerHandle for MemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv(&mut self) -> Result<Option<Record>, TransportError> {
        loop {
            if !self.open || !self.state.connected.load(Ordering::Acquire) {
                return Ok(None);
            }

            // Register interest before checking, so an append between the
            // check and the await is not missed.
            let appended = self.appended.notified();
            let closed = self.state.closed.notified();

            if let Some(mut entry) = self.state.topics.get_mut(&self.topic) {
                if let Some(record) = entry.poll(&self.group_id) {
                    return Ok(Some(record));
                }
            }

            tokio::select! {
                () = appended => {}
                () = closed => {}
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.open = false;
        debug!(topic = %self.topic, group = %self.group_id, "Consumer left group");
        Ok(())
    }
}

struct MemoryProducer {
    state: Arc<BrokerState>,
    open: AtomicBool,
}

#[async_trait]
impl ProducerHandle for MemoryProducer {
    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        self.state.ensure_connected()?;
        self.state
            .append(topic, payload)
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn connected() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let broker = MemoryBroker::unreachable();
        assert!(matches!(
            broker.connect().await,
            Err(TransportError::ConnectFailed(_))
        ));
        assert!(broker.admin().await.is_err());
    }

    #[tokio::test]
    async fn test_handles_require_connection() {
        let broker = MemoryBroker::new();
        assert!(broker.producer().await.is_err());
        assert!(broker
            .consumer("grp", "in", StartOffset::Earliest)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_consumer_reads_from_beginning() {
        let broker = connected().await;
        broker.publish("in", "first").unwrap();

        let mut consumer = broker
            .consumer("grp", "in", StartOffset::Earliest)
            .await
            .unwrap();
        let record = consumer.recv().await.unwrap().unwrap();
        assert_eq!(record.value_lossy(), "first");
        assert_eq!(record.offset, 0);
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_publish() {
        let broker = connected().await;
        let mut consumer = broker
            .consumer("grp", "in", StartOffset::Earliest)
            .await
            .unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish("in", "late").unwrap();
        });

        let record = tokio::time::timeout(Duration::from_secs(1), consumer.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.value_lossy(), "late");
    }

    #[tokio::test]
    async fn test_same_group_shares_position() {
        let broker = connected().await;
        broker.publish("in", "a").unwrap();
        broker.publish("in", "b").unwrap();

        let mut c1 = broker.consumer("grp", "in", StartOffset::Earliest).await.unwrap();
        let mut c2 = broker.consumer("grp", "in", StartOffset::Earliest).await.unwrap();

        let first = c1.recv().await.unwrap().unwrap();
        let second = c2.recv().await.unwrap().unwrap();
        assert_eq!(first.value_lossy(), "a");
        assert_eq!(second.value_lossy(), "b");
    }

    #[tokio::test]
    async fn test_broker_disconnect_ends_consumers() {
        let broker = connected().await;
        let mut consumer = broker
            .consumer("grp", "in", StartOffset::Earliest)
            .await
            .unwrap();

        let closer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.disconnect().await.unwrap();
        });

        let next = tokio::time::timeout(Duration::from_secs(1), consumer.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_producer_appends_and_closes() {
        let broker = connected().await;
        let producer = broker.producer().await.unwrap();

        producer.send("out", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(broker.records("out").len(), 1);

        producer.disconnect().await.unwrap();
        assert!(producer.send("out", Bytes::from_static(b"y")).await.is_err());
        assert!(producer.disconnect().await.is_err());
    }

    #[tokio::test]
    async fn test_admin_lists_topics() {
        let broker = connected().await;
        broker.publish("alpha", "1").unwrap();
        let mut admin = broker.admin().await.unwrap();

        assert_eq!(admin.list_topics().await.unwrap(), vec!["alpha".to_string()]);
        admin.disconnect().await.unwrap();
        assert!(admin.list_topics().await.is_err());
    }

    #[tokio::test]
    async fn test_topic_limits() {
        let broker = MemoryBroker::with_config(MemoryBrokerConfig {
            max_topics: 1,
            ..MemoryBrokerConfig::default()
        });
        broker.connect().await.unwrap();

        broker.publish("one", "x").unwrap();
        assert!(broker.publish("two", "x").is_err());
        assert!(broker.publish("bad topic", "x").is_err());
    }
}
