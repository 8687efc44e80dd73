//! The route contract.
//!
//! Every inbound endpoint, whatever its transport, is a [`Route`]: an
//! immutable [`RouteDescriptor`] plus a `bind` operation that attaches the
//! route's pipeline to its transport and hands back a [`BoundRoute`]. The
//! bound route owns every live handle and is the only thing that can release
//! them.

use async_trait::async_trait;
use orbit_transport::{Broker, HttpDispatch, HttpMethod, StartOffset, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The transport family a route is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// Request/response over HTTP.
    SyncInbound,
    /// Consume from one broker topic, publish to another.
    StreamInbound,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKind::SyncInbound => f.write_str("SYNC_INBOUND"),
            RouteKind::StreamInbound => f.write_str("STREAM_INBOUND"),
        }
    }
}

/// Identity of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDescriptor {
    id: String,
    kind: RouteKind,
    description: Option<String>,
}

impl RouteDescriptor {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: RouteKind) -> Self {
        Self {
            id: id.into(),
            kind,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Unique identifier within a registry.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> RouteKind {
        self.kind
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Settings stream routes apply when binding.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Consumer group shared by every stream route in the process.
    pub group_id: String,
    /// Where a new group starts reading.
    pub start: StartOffset,
    /// Outputs held per route while its producer is not ready. Zero drops them.
    pub pending_output_capacity: usize,
    /// Time allowed for in-flight messages when a route is unbound.
    pub drain_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            group_id: "orbit".to_string(),
            start: StartOffset::Earliest,
            pending_output_capacity: 1024,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// What a route may touch while binding.
///
/// The broker is shared: routes take handles from it but never connect,
/// disconnect or reconfigure it.
pub struct BindContext<'a> {
    pub http: &'a mut HttpDispatch,
    pub broker: Arc<dyn Broker>,
    pub stream: StreamSettings,
}

/// Bind-time errors. Each one skips the offending route only.
#[derive(Debug, Error)]
pub enum RouteError {
    /// `bind` was called on a route that is already bound.
    #[error("Route {0} is already bound")]
    RouteAlreadyBound(String),

    /// The HTTP layer cannot route the declared method.
    #[error("Route {route}: unsupported method {method}")]
    UnsupportedMethod { route: String, method: HttpMethod },

    /// The descriptor cannot be bound as written.
    #[error("Route {route}: malformed descriptor: {reason}")]
    MalformedDescriptor { route: String, reason: String },

    /// Another route already owns this `(method, path)` pair.
    #[error("Route {route}: {method} {path} is already bound by another route")]
    RouteConflict {
        route: String,
        method: HttpMethod,
        path: String,
    },

    /// A transport handle could not be acquired.
    #[error("Route {route}: transport error: {source}")]
    Transport {
        route: String,
        #[source]
        source: TransportError,
    },
}

/// Handles that failed to release during unbind.
#[derive(Debug, Error)]
#[error("Route {route}: {} handle(s) failed to release: {}", .failures.len(), describe(.failures))]
pub struct UnbindError {
    pub route: String,
    pub failures: Vec<(&'static str, TransportError)>,
}

fn describe(failures: &[(&'static str, TransportError)]) -> String {
    failures
        .iter()
        .map(|(handle, e)| format!("{handle}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// An inbound endpoint that can be attached to its transport.
#[async_trait]
pub trait Route: Send + Sync {
    /// The route's identity.
    fn descriptor(&self) -> &RouteDescriptor;

    /// Attach the route to its transport.
    ///
    /// May succeed at most once per route instance.
    ///
    /// # Errors
    ///
    /// [`RouteError::RouteAlreadyBound`] on a second call; otherwise any
    /// reason the route could not be attached.
    async fn bind(&self, ctx: &mut BindContext<'_>) -> Result<Box<dyn BoundRoute>, RouteError>;
}

/// A live route. Dropping it without calling [`BoundRoute::unbind`] leaks
/// its transport handles until the process exits.
#[async_trait]
pub trait BoundRoute: Send {
    /// Id of the route this binding belongs to.
    fn id(&self) -> &str;

    /// Detach from the transport and release every handle.
    ///
    /// Every handle is released even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the handles that failed to release.
    async fn unbind(&mut self) -> Result<(), UnbindError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor() {
        let descriptor = RouteDescriptor::new("GET_COUNTRIES", RouteKind::SyncInbound)
            .with_description("List countries");
        assert_eq!(descriptor.id(), "GET_COUNTRIES");
        assert_eq!(descriptor.kind(), RouteKind::SyncInbound);
        assert_eq!(descriptor.description(), Some("List countries"));
        assert_eq!(descriptor.kind().to_string(), "SYNC_INBOUND");
    }

    #[test]
    fn test_unbind_error_lists_every_failure() {
        let err = UnbindError {
            route: "NOTIFY_WORKER".into(),
            failures: vec![
                ("admin", TransportError::ConnectionClosed),
                ("producer", TransportError::DisconnectFailed("flush".into())),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Route NOTIFY_WORKER: 2 handle(s) failed to release: admin: Connection closed; producer: Disconnect failed: flush"
        );
    }
}
