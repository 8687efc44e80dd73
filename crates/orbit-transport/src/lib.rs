//! # orbit-transport
//!
//! Transport collaborators for the Orbit service kernel.
//!
//! The routing core never talks to a client library directly; it goes through
//! the interfaces defined here:
//!
//! - **HTTP** - a `(method, path)` dispatch table and a listener, built on axum
//! - **Broker** - admin, consumer and producer handles for an event broker
//! - **Document store** - connection lifecycle and a lookup used at startup
//!
//! In-process implementations of the broker and the document store live in
//! [`memory`].
//!
//! ```rust,ignore
//! use orbit_transport::{Broker, StartOffset};
//!
//! async fn drain(broker: &dyn Broker) {
//!     let mut consumer = broker.consumer("grp", "in", StartOffset::Earliest).await?;
//!     while let Some(record) = consumer.recv().await? {
//!         // Process record
//!     }
//! }
//! ```

pub mod http;
pub mod memory;
pub mod record;
pub mod traits;

pub use axum::http::{Method, StatusCode, Uri};
pub use http::{
    DispatchError, HttpDispatch, HttpListener, HttpMethod, InboundRequest, Reply,
    RequestHandler, RequestHook,
};
pub use memory::{MemoryBroker, MemoryDocumentStore};
pub use record::Record;
pub use traits::{
    AdminHandle, Broker, ConsumerHandle, DocumentStore, ProducerHandle, StartOffset,
    TransportError,
};
