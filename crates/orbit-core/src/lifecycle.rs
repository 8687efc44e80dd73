//! Service lifecycle orchestration.
//!
//! The [`Orchestrator`] brings a service up in a fixed order and tears it
//! down in a fixed order:
//!
//! ```text
//! INIT → CONNECTING_DEPENDENCIES → BINDING_ROUTES → LISTENING → SHUTTING_DOWN → CLOSED
//! ```
//!
//! Failing to reach either dependency, or binding none of the registered
//! routes, is fatal and nothing is exposed. A single route failing to bind
//! only skips that route. Shutdown attempts every step regardless of earlier
//! failures and reports all of them.

use crate::activity::ActivityMonitor;
use crate::metrics::{self, RequestMetrics};
use crate::registry::RouteRegistry;
use crate::route::{BindContext, BoundRoute, StreamSettings};
use orbit_transport::{
    Broker, DocumentStore, HttpDispatch, HttpListener, RequestHook, TransportError,
};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Service-level lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Init,
    ConnectingDependencies,
    BindingRoutes,
    Listening,
    ShuttingDown,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Init => "INIT",
            LifecycleState::ConnectingDependencies => "CONNECTING_DEPENDENCIES",
            LifecycleState::BindingRoutes => "BINDING_ROUTES",
            LifecycleState::Listening => "LISTENING",
            LifecycleState::ShuttingDown => "SHUTTING_DOWN",
            LifecycleState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// A collection to look up right after the document store connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreProbe {
    pub database: String,
    pub collection: String,
}

/// Validated settings the orchestrator runs with.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub stream: StreamSettings,
    /// Idle check interval; `None` disables the activity monitor.
    pub idle_interval: Option<Duration>,
    pub store_connect_timeout: Duration,
    pub probe: Option<StoreProbe>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            stream: StreamSettings::default(),
            idle_interval: Some(crate::activity::DEFAULT_IDLE_INTERVAL),
            store_connect_timeout: Duration::from_secs(30),
            probe: None,
        }
    }
}

impl ServiceConfig {
    /// Check the values the orchestrator cannot run without.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Config`] naming the first bad value.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.stream.group_id.trim().is_empty() {
            return Err(StartupError::Config("stream group id cannot be empty".into()));
        }
        if self.idle_interval == Some(Duration::ZERO) {
            return Err(StartupError::Config("idle interval must be greater than zero".into()));
        }
        if self.store_connect_timeout.is_zero() {
            return Err(StartupError::Config(
                "document store connect timeout must be greater than zero".into(),
            ));
        }
        if let Some(probe) = &self.probe {
            if probe.database.trim().is_empty() || probe.collection.trim().is_empty() {
                return Err(StartupError::Config(
                    "store probe needs both a database and a collection".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Startup failures. All of them are fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Document store connection failed: {0}")]
    DocumentStore(#[source] TransportError),

    #[error("Broker connection failed: {0}")]
    Broker(#[source] TransportError),

    #[error("None of the {0} registered routes could be bound")]
    NoRoutesBound(usize),

    #[error("HTTP listener failed to start: {0}")]
    Listen(#[source] TransportError),
}

/// A shutdown step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Unbinding the route with this id.
    Unbind(String),
    CloseListener,
    DisconnectBroker,
    DisconnectStore,
}

impl fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownStep::Unbind(id) => write!(f, "unbind {id}"),
            ShutdownStep::CloseListener => f.write_str("close listener"),
            ShutdownStep::DisconnectBroker => f.write_str("disconnect broker"),
            ShutdownStep::DisconnectStore => f.write_str("disconnect document store"),
        }
    }
}

/// What happened during shutdown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Ids of every route whose unbind was attempted, in order.
    pub unbound: Vec<String>,
    /// Steps that failed, with their errors.
    pub failures: Vec<(ShutdownStep, String)>,
}

impl ShutdownReport {
    fn fail(&mut self, step: ShutdownStep, error: impl fmt::Display) {
        error!(step = %step, error = %error, "Shutdown step failed");
        self.failures.push((step, error.to_string()));
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Process exit code: 0 when every step succeeded, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.is_clean())
    }
}

/// Unbind every route, in order, once each.
async fn unbind_all(bound: Vec<Box<dyn BoundRoute>>, report: &mut ShutdownReport) {
    for mut route in bound {
        let id = route.id().to_string();
        match route.unbind().await {
            Ok(()) => debug!(route = %id, "Route unbound"),
            Err(e) => report.fail(ShutdownStep::Unbind(id.clone()), e),
        }
        report.unbound.push(id);
    }
    metrics::set_routes_bound(0);
}

async fn disconnect_dependencies(
    broker: &dyn Broker,
    store: &dyn DocumentStore,
    report: &mut ShutdownReport,
) {
    match broker.disconnect().await {
        Ok(()) => info!("Disconnected from {} broker", broker.name()),
        Err(e) => report.fail(ShutdownStep::DisconnectBroker, e),
    }
    match store.disconnect().await {
        Ok(()) => info!("Disconnected from {} document store", store.name()),
        Err(e) => report.fail(ShutdownStep::DisconnectStore, e),
    }
}

/// Sequences dependency connection, route binding, listening and shutdown.
pub struct Orchestrator {
    config: ServiceConfig,
    registry: RouteRegistry,
    store: Arc<dyn DocumentStore>,
    broker: Arc<dyn Broker>,
    hooks: Vec<Arc<dyn RequestHook>>,
    state: watch::Sender<LifecycleState>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        registry: RouteRegistry,
        store: Arc<dyn DocumentStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Init);
        Self {
            config,
            registry,
            store,
            broker,
            hooks: Vec::new(),
            state,
        }
    }

    /// Observe every HTTP request in addition to the built-in hooks.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn RequestHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        debug!("Lifecycle: {} -> {}", previous, next);
    }

    async fn connect_store(&self) -> Result<(), TransportError> {
        let timeout = self.config.store_connect_timeout;
        info!("Connecting to {} document store", self.store.name());
        match tokio::time::timeout(timeout, self.store.connect()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn probe_store(&self) {
        let Some(probe) = &self.config.probe else {
            return;
        };
        match self.store.find_one(&probe.database, &probe.collection).await {
            Ok(Some(document)) => {
                let id = document.get("_id").cloned().unwrap_or_default();
                info!("First document in {}: _id = {}", probe.collection, id);
            }
            Ok(None) => warn!("No documents found in {}", probe.collection),
            Err(e) => warn!(collection = %probe.collection, error = %e, "Document store probe failed"),
        }
    }

    /// Release whatever startup acquired before failing.
    async fn abort_startup(&self, bound: Vec<Box<dyn BoundRoute>>, broker_connected: bool) {
        let mut report = ShutdownReport::default();
        unbind_all(bound, &mut report).await;
        if broker_connected {
            disconnect_dependencies(self.broker.as_ref(), self.store.as_ref(), &mut report).await;
        } else if let Err(e) = self.store.disconnect().await {
            report.fail(ShutdownStep::DisconnectStore, e);
        }
        self.transition(LifecycleState::Closed);
    }

    /// Connect dependencies, bind routes and start listening.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped startup. Everything acquired up
    /// to that point has been released and no listener is running.
    pub async fn start(self) -> Result<RunningService, StartupError> {
        if let Err(e) = self.config.validate() {
            error!(error = %e, "Refusing to start");
            self.transition(LifecycleState::Closed);
            return Err(e);
        }
        self.transition(LifecycleState::ConnectingDependencies);

        if let Err(e) = self.connect_store().await {
            error!(transport = self.store.name(), error = %e, "Failed to connect to document store");
            self.transition(LifecycleState::Closed);
            return Err(StartupError::DocumentStore(e));
        }
        info!("Connected to {} document store", self.store.name());
        self.probe_store().await;

        if let Err(e) = self.broker.connect().await {
            error!(transport = self.broker.name(), error = %e, "Failed to connect to broker");
            self.abort_startup(Vec::new(), false).await;
            return Err(StartupError::Broker(e));
        }
        info!("Connected to {} broker", self.broker.name());

        self.transition(LifecycleState::BindingRoutes);
        let monitor = self
            .config
            .idle_interval
            .map(|interval| Arc::new(ActivityMonitor::new(interval)));

        let mut http = HttpDispatch::new();
        if let Some(monitor) = &monitor {
            http.add_hook(Arc::clone(monitor) as Arc<dyn RequestHook>);
        }
        http.add_hook(Arc::new(RequestMetrics));
        for hook in &self.hooks {
            http.add_hook(Arc::clone(hook));
        }

        let mut bound: Vec<Box<dyn BoundRoute>> = Vec::with_capacity(self.registry.len());
        {
            let mut ctx = BindContext {
                http: &mut http,
                broker: Arc::clone(&self.broker),
                stream: self.config.stream.clone(),
            };
            for route in self.registry.routes() {
                let descriptor = route.descriptor();
                match route.bind(&mut ctx).await {
                    Ok(handle) => {
                        info!(route = %descriptor.id(), kind = %descriptor.kind(), "Route bound");
                        bound.push(handle);
                    }
                    Err(e) => {
                        error!(
                            route = %descriptor.id(),
                            kind = %descriptor.kind(),
                            error = %e,
                            "Failed to bind route, skipping"
                        );
                    }
                }
            }
        }
        metrics::set_routes_bound(bound.len());

        if self.registry.is_empty() {
            warn!("No routes registered");
        } else if bound.is_empty() {
            error!("None of the {} registered routes could be bound", self.registry.len());
            let registered = self.registry.len();
            self.abort_startup(bound, true).await;
            return Err(StartupError::NoRoutesBound(registered));
        }

        let listener = match HttpListener::bind(self.config.listen_addr, http.into_router()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %self.config.listen_addr, error = %e, "Failed to start HTTP listener");
                self.abort_startup(bound, true).await;
                return Err(StartupError::Listen(e));
            }
        };

        self.transition(LifecycleState::Listening);
        let monitor_task = monitor.as_ref().map(ActivityMonitor::spawn);
        info!("Server listening at http://{}", listener.local_addr());
        info!("All services started successfully");

        Ok(RunningService {
            registry: self.registry,
            store: self.store,
            broker: self.broker,
            state: self.state,
            bound,
            listener,
            monitor,
            monitor_task,
        })
    }

    /// Start, serve until `signal` resolves, then shut down.
    ///
    /// Returns the process exit code: 0 after a clean shutdown, 1 after a
    /// fatal startup error or any failed shutdown step.
    pub async fn run<F>(self, signal: F) -> u8
    where
        F: Future<Output = ()>,
    {
        match self.start().await {
            Ok(service) => service.run_until(signal).await.exit_code(),
            Err(e) => {
                error!(error = %e, "Startup failed");
                1
            }
        }
    }
}

/// A service in the `LISTENING` state.
pub struct RunningService {
    /// Kept so bound routes cannot be bound again for the life of the service.
    registry: RouteRegistry,
    store: Arc<dyn DocumentStore>,
    broker: Arc<dyn Broker>,
    state: watch::Sender<LifecycleState>,
    bound: Vec<Box<dyn BoundRoute>>,
    listener: HttpListener,
    monitor: Option<Arc<ActivityMonitor>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl RunningService {
    /// Address the HTTP listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Ids of the bound routes, in binding order.
    #[must_use]
    pub fn bound_ids(&self) -> Vec<&str> {
        self.bound.iter().map(|b| b.id()).collect()
    }

    #[must_use]
    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// The activity monitor, if enabled.
    #[must_use]
    pub fn activity(&self) -> Option<&Arc<ActivityMonitor>> {
        self.monitor.as_ref()
    }

    /// Serve until `signal` resolves, then shut down.
    pub async fn run_until<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        signal.await;
        info!("Shutdown signal received");
        self.shutdown().await
    }

    /// Unbind every route, close the listener, then disconnect the broker and
    /// the document store. Every step runs even if an earlier one fails.
    pub async fn shutdown(mut self) -> ShutdownReport {
        self.state.send_replace(LifecycleState::ShuttingDown);
        info!("Shutting down gracefully...");

        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }

        let mut report = ShutdownReport::default();
        info!("Unregistering all routes");
        unbind_all(std::mem::take(&mut self.bound), &mut report).await;

        match self.listener.close().await {
            Ok(()) => info!("HTTP listener closed"),
            Err(e) => report.fail(ShutdownStep::CloseListener, e),
        }

        disconnect_dependencies(self.broker.as_ref(), self.store.as_ref(), &mut report).await;

        self.state.send_replace(LifecycleState::Closed);
        if report.is_clean() {
            info!("Server closed");
        } else {
            warn!(failures = report.failures.len(), "Server closed with errors");
        }
        report
    }
}
