//! Synchronous request/response routes.
//!
//! A sync route runs `extract → [process] → respond` for every request on
//! its `(method, path)` pair. Routes are assembled with a typed builder:
//!
//! ```rust,ignore
//! let route = SyncRoute::builder("GET_COUNTRIES", HttpMethod::Get, "/countries")
//!     .extract(|_req| async { Ok::<_, BoxError>(vec!["india", "usa", "uk"]) })
//!     .respond(|countries| async move { Ok::<_, BoxError>(Json(countries)) });
//! ```
//!
//! Without a `process` stage, `respond` receives exactly what `extract`
//! returned; the builder only offers `respond` over the extracted type in
//! that case.

use crate::codec::{BoxError, IntoReply};
use crate::metrics;
use crate::pipeline::{identity, stage, PipelineError, Stage, StageName};
use crate::route::{BindContext, BoundRoute, Route, RouteDescriptor, RouteError, RouteKind, UnbindError};
use async_trait::async_trait;
use futures_util::FutureExt;
use orbit_transport::{DispatchError, HttpMethod, InboundRequest, Reply, RequestHandler, StatusCode};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Error body for requests whose pipeline failed.
pub const INTERNAL_ERROR: &str = "Internal server error";

/// The optional middle stage of a sync pipeline.
pub enum ProcessStage<E, P> {
    /// No process stage; `respond` receives the extracted value.
    Absent(PassThrough<E, P>),
    Present(Stage<E, P>),
}

/// Proof that the extracted type is the responded type. Only constructible
/// for `PassThrough<T, T>`.
pub struct PassThrough<E, P>(fn(E) -> P);

impl<T> PassThrough<T, T> {
    fn new() -> Self {
        Self(std::convert::identity)
    }
}

/// A request/response route over HTTP.
pub struct SyncRoute<E, P, O> {
    descriptor: RouteDescriptor,
    method: HttpMethod,
    path: String,
    extract: Stage<InboundRequest, E>,
    process: ProcessStage<E, P>,
    respond: Stage<P, O>,
    bound: AtomicBool,
}

impl SyncRoute<(), (), ()> {
    /// Start building a route for `method path`.
    pub fn builder(
        id: impl Into<String>,
        method: HttpMethod,
        path: impl Into<String>,
    ) -> SyncRouteBuilder {
        SyncRouteBuilder {
            descriptor: RouteDescriptor::new(id, RouteKind::SyncInbound),
            method,
            path: path.into(),
        }
    }
}

impl<E, P, O> SyncRoute<E, P, O> {
    #[must_use]
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the route declares a `process` stage.
    #[must_use]
    pub fn has_process(&self) -> bool {
        matches!(self.process, ProcessStage::Present(_))
    }
}

/// Builder for a [`SyncRoute`], before `extract` is set.
pub struct SyncRouteBuilder {
    descriptor: RouteDescriptor,
    method: HttpMethod,
    path: String,
}

impl SyncRouteBuilder {
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.descriptor = self.descriptor.with_description(description);
        self
    }

    /// Set the stage that turns the request into the pipeline's input.
    pub fn extract<E, Err, F, Fut>(self, f: F) -> Extracted<E>
    where
        E: Send + 'static,
        Err: Into<BoxError>,
        F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E, Err>> + Send + 'static,
    {
        Extracted {
            builder: self,
            extract: stage(f),
        }
    }
}

/// Builder for a [`SyncRoute`] with `extract` set.
pub struct Extracted<E> {
    builder: SyncRouteBuilder,
    extract: Stage<InboundRequest, E>,
}

impl<E: Send + 'static> Extracted<E> {
    /// Add a `process` stage between `extract` and `respond`.
    pub fn process<P, Err, F, Fut>(self, f: F) -> Processed<E, P>
    where
        P: Send + 'static,
        Err: Into<BoxError>,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P, Err>> + Send + 'static,
    {
        Processed {
            builder: self.builder,
            extract: self.extract,
            process: stage(f),
        }
    }

    /// Finish with a `respond` stage that receives the extracted value.
    pub fn respond<O, Err, F, Fut>(self, f: F) -> SyncRoute<E, E, O>
    where
        O: IntoReply + Send + 'static,
        Err: Into<BoxError>,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Err>> + Send + 'static,
    {
        SyncRoute {
            descriptor: self.builder.descriptor,
            method: self.builder.method,
            path: self.builder.path,
            extract: self.extract,
            process: ProcessStage::Absent(PassThrough::new()),
            respond: stage(f),
            bound: AtomicBool::new(false),
        }
    }
}

/// Builder for a [`SyncRoute`] with `extract` and `process` set.
pub struct Processed<E, P> {
    builder: SyncRouteBuilder,
    extract: Stage<InboundRequest, E>,
    process: Stage<E, P>,
}

impl<E: Send + 'static, P: Send + 'static> Processed<E, P> {
    /// Finish with a `respond` stage that receives the processed value.
    pub fn respond<O, Err, F, Fut>(self, f: F) -> SyncRoute<E, P, O>
    where
        O: IntoReply + Send + 'static,
        Err: Into<BoxError>,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Err>> + Send + 'static,
    {
        SyncRoute {
            descriptor: self.builder.descriptor,
            method: self.builder.method,
            path: self.builder.path,
            extract: self.extract,
            process: ProcessStage::Present(self.process),
            respond: stage(f),
            bound: AtomicBool::new(false),
        }
    }
}

/// The stages of a bound sync route, with the optional stage resolved.
struct SyncPipeline<E, P, O> {
    route: String,
    extract: Stage<InboundRequest, E>,
    process: Stage<E, P>,
    respond: Stage<P, O>,
    active: Arc<AtomicBool>,
}

impl<E, P, O> SyncPipeline<E, P, O>
where
    E: Send + 'static,
    P: Send + 'static,
    O: IntoReply + Send + 'static,
{
    async fn run(&self, request: InboundRequest) -> Result<Reply, PipelineError> {
        let fail = |stage| {
            let route = self.route.as_str();
            move |e: BoxError| PipelineError::new(route, stage, e)
        };

        let extracted = (self.extract)(request)
            .await
            .map_err(fail(StageName::Extract))?;
        let processed = (self.process)(extracted)
            .await
            .map_err(fail(StageName::Process))?;
        let output = (self.respond)(processed)
            .await
            .map_err(fail(StageName::Respond))?;
        output.into_reply().map_err(fail(StageName::Respond))
    }

    async fn handle(&self, request: InboundRequest) -> Reply {
        if !self.active.load(Ordering::Acquire) {
            debug!(route = %self.route, "Request for unbound route");
            return Reply::not_found();
        }

        match AssertUnwindSafe(self.run(request)).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                error!(
                    route = %e.route,
                    stage = %e.stage,
                    transport = "http",
                    error = %e.source,
                    "Sync pipeline failed"
                );
                metrics::record_pipeline_error(&self.route, e.stage.as_str());
                Reply::error(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
            }
            Err(_) => {
                error!(route = %self.route, transport = "http", "Sync pipeline panicked");
                metrics::record_pipeline_error(&self.route, "panic");
                Reply::error(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
            }
        }
    }
}

#[async_trait]
impl<E, P, O> Route for SyncRoute<E, P, O>
where
    E: Send + 'static,
    P: Send + 'static,
    O: IntoReply + Send + 'static,
{
    fn descriptor(&self) -> &RouteDescriptor {
        &self.descriptor
    }

    async fn bind(&self, ctx: &mut BindContext<'_>) -> Result<Box<dyn BoundRoute>, RouteError> {
        let id = self.descriptor.id();
        if self.bound.swap(true, Ordering::AcqRel) {
            return Err(RouteError::RouteAlreadyBound(id.to_string()));
        }

        // Resolve the optional stage once, here, rather than per request.
        let process: Stage<E, P> = match &self.process {
            ProcessStage::Present(process) => Arc::clone(process),
            ProcessStage::Absent(pass) => {
                let pass = pass.0;
                let identity = identity::<E>();
                Arc::new(move |e: E| {
                    let fut = identity(e);
                    async move { fut.await.map(pass) }.boxed()
                })
            }
        };

        let active = Arc::new(AtomicBool::new(true));
        let pipeline = Arc::new(SyncPipeline {
            route: id.to_string(),
            extract: Arc::clone(&self.extract),
            process,
            respond: Arc::clone(&self.respond),
            active: Arc::clone(&active),
        });
        let handler: RequestHandler = Arc::new(move |request: InboundRequest| {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.handle(request).await }.boxed()
        });

        if let Err(e) = ctx.http.register(self.method, &self.path, handler) {
            self.bound.store(false, Ordering::Release);
            return Err(match e {
                DispatchError::UnsupportedMethod(method) => RouteError::UnsupportedMethod {
                    route: id.to_string(),
                    method,
                },
                DispatchError::InvalidPath { reason, .. } => RouteError::MalformedDescriptor {
                    route: id.to_string(),
                    reason: format!("path {:?}: {reason}", self.path),
                },
                DispatchError::Conflict { method, path } => RouteError::RouteConflict {
                    route: id.to_string(),
                    method,
                    path,
                },
                DispatchError::Overlap { existing, .. } => RouteError::MalformedDescriptor {
                    route: id.to_string(),
                    reason: format!("path {:?} overlaps {existing:?}", self.path),
                },
            });
        }

        info!("Registering {} {}", self.method, self.path);
        debug!(
            route = %id,
            process = if self.has_process() { "present" } else { "absent" },
            "Sync route bound"
        );
        Ok(Box::new(BoundSyncRoute {
            id: id.to_string(),
            method: self.method,
            path: self.path.clone(),
            active,
        }))
    }
}

/// A sync route attached to the dispatch table.
///
/// The table cannot drop handlers once served, so unbinding deactivates the
/// handler; it answers 404 from then on.
struct BoundSyncRoute {
    id: String,
    method: HttpMethod,
    path: String,
    active: Arc<AtomicBool>,
}

#[async_trait]
impl BoundRoute for BoundSyncRoute {
    fn id(&self) -> &str {
        &self.id
    }

    async fn unbind(&mut self) -> Result<(), UnbindError> {
        if self.active.swap(false, Ordering::AcqRel) {
            info!("Unregistering {} {}", self.method, self.path);
        }
        Ok(())
    }
}
