//! # orbit-core
//!
//! Route contract, typed pipelines, binders and lifecycle orchestration for
//! Orbit services.
//!
//! A service is a [`RouteRegistry`] of heterogeneous routes handed to an
//! [`Orchestrator`] together with its document store and event broker:
//!
//! - [`SyncRoute`] - `extract → [process] → respond` over HTTP
//! - [`StreamRoute`] - `consume → process → produce` between broker topics
//!
//! ```rust,ignore
//! use orbit_core::{BoxError, HttpMethod, Orchestrator, RouteRegistry, SyncRoute};
//!
//! let mut registry = RouteRegistry::new();
//! registry.register(
//!     SyncRoute::builder("GET_COUNTRIES", HttpMethod::Get, "/countries")
//!         .extract(|_req| async { Ok::<_, BoxError>(vec!["india", "usa", "uk"]) })
//!         .respond(|c| async move { Ok::<_, BoxError>(serde_json::to_string(&c)?) }),
//! )?;
//!
//! let code = Orchestrator::new(config, registry, store, broker)
//!     .run(shutdown_signal())
//!     .await;
//! ```

pub mod activity;
pub mod codec;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod route;
pub mod stream_route;
pub mod sync_route;

pub use activity::ActivityMonitor;
pub use codec::{BoxError, Encode, IntoReply, Json};
pub use lifecycle::{
    LifecycleState, Orchestrator, RunningService, ServiceConfig, ShutdownReport, ShutdownStep,
    StartupError, StoreProbe,
};
pub use pipeline::{PipelineError, Stage, StageName};
pub use registry::{RegistryError, RouteRegistry};
pub use route::{
    BindContext, BoundRoute, Route, RouteDescriptor, RouteError, RouteKind, StreamSettings,
    UnbindError,
};
pub use stream_route::{Delivery, Outbox, StreamRoute};
pub use sync_route::SyncRoute;

pub use orbit_transport::{HttpMethod, InboundRequest, Record, Reply, StartOffset, StatusCode};
