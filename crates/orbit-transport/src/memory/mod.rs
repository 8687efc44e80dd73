//! In-process transports.
//!
//! Used by tests and by `memory://` deployments.

pub mod broker;
pub mod store;
pub mod topic;

pub use broker::{MemoryBroker, MemoryBrokerConfig};
pub use store::MemoryDocumentStore;
pub use topic::{validate_topic_name, TopicLog};
