//! HTTP dispatch table and listener.
//!
//! Routes are registered one `(method, path)` pair at a time into an axum
//! router. Once every route is registered the table is frozen, wrapped with
//! the request hooks and the not-found fallback, and served.

use axum::{
    body::Bytes,
    extract::{RawPathParams, Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{on, MethodFilter},
    Router,
};
use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::traits::TransportError;

/// Error body for requests no bound route matches.
pub const ROUTE_NOT_FOUND_ERROR: &str = "Route not found";

/// Largest request body read into an [`InboundRequest`].
pub const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// HTTP methods a route may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl HttpMethod {
    /// All declarable methods.
    pub const ALL: [HttpMethod; 9] = [
        HttpMethod::Get,
        HttpMethod::Head,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Delete,
        HttpMethod::Connect,
        HttpMethod::Options,
        HttpMethod::Trace,
        HttpMethod::Patch,
    ];

    /// Upper-case method name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Patch => "PATCH",
        }
    }

    /// The axum method filter, if the dispatch table can route this method.
    ///
    /// `CONNECT` has no filter: tunnelling requests never reach route handlers.
    #[must_use]
    pub fn filter(&self) -> Option<MethodFilter> {
        match self {
            HttpMethod::Get => Some(MethodFilter::GET),
            HttpMethod::Head => Some(MethodFilter::HEAD),
            HttpMethod::Post => Some(MethodFilter::POST),
            HttpMethod::Put => Some(MethodFilter::PUT),
            HttpMethod::Delete => Some(MethodFilter::DELETE),
            HttpMethod::Options => Some(MethodFilter::OPTIONS),
            HttpMethod::Trace => Some(MethodFilter::TRACE),
            HttpMethod::Patch => Some(MethodFilter::PATCH),
            HttpMethod::Connect => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HttpMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown HTTP method: {s}"))
    }
}

/// A request as seen by a route pipeline.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Values captured by the path template.
    pub params: HashMap<String, String>,
    pub body: Bytes,
}

impl InboundRequest {
    /// Build a request without transport details, mainly for tests.
    #[must_use]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            params: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a captured path parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Get the raw query string.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Deserialize the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// A response produced by a route pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: Bytes,
}

impl Reply {
    /// `200 OK` with a plain-text body.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some("text/plain; charset=utf-8"),
            body: Bytes::from(body.into()),
        }
    }

    /// `200 OK` with a JSON body.
    #[must_use]
    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some("application/json"),
            body: Bytes::from(value.to_string()),
        }
    }

    /// An `{"error": message}` JSON body with the given status.
    #[must_use]
    pub fn error(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            ..Self::json(&serde_json::json!({ "error": message }))
        }
    }

    /// The 404 reply used for unmatched or unbound routes.
    #[must_use]
    pub fn not_found() -> Self {
        Self::error(StatusCode::NOT_FOUND, ROUTE_NOT_FOUND_ERROR)
    }

    /// Override the status code.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        if let Some(content_type) = self.content_type {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static(content_type),
            );
        }
        response
    }
}

/// A bound request handler. Handlers never fail: errors become replies.
pub type RequestHandler = Arc<dyn Fn(InboundRequest) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Observer of every inbound request, matched or not.
pub trait RequestHook: Send + Sync {
    /// Called before the request is dispatched.
    fn on_request(&self, method: &Method, uri: &Uri);

    /// Called after the response is produced.
    fn on_response(&self, _method: &Method, _uri: &Uri, _status: StatusCode) {}
}

/// Dispatch table errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The table cannot route this method.
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(HttpMethod),

    /// The path template is not routable.
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// A handler is already registered for this pair.
    #[error("Route already registered: {method} {path}")]
    Conflict { method: HttpMethod, path: String },

    /// The template cannot share the router with one already registered.
    #[error("Path {path:?} overlaps {existing:?}")]
    Overlap { path: String, existing: String },
}

/// Validate a route path template.
///
/// # Errors
///
/// Returns the reason the path cannot be routed.
pub fn validate_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("path cannot be empty");
    }
    if !path.starts_with('/') {
        return Err("path must start with '/'");
    }
    if path.chars().any(char::is_whitespace) {
        return Err("path cannot contain whitespace");
    }
    if path.contains("//") {
        return Err("path cannot contain empty segments");
    }
    Ok(())
}

/// The HTTP dispatch table, keyed by `(method, path)`.
pub struct HttpDispatch {
    router: Router,
    /// Mirrors the templates inside `router`, which panics on rejection.
    templates: matchit::Router<()>,
    paths: HashSet<String>,
    registered: HashSet<(HttpMethod, String)>,
    hooks: Vec<Arc<dyn RequestHook>>,
}

impl Default for HttpDispatch {
    fn default() -> Self {
        Self {
            router: Router::new(),
            templates: matchit::Router::new(),
            paths: HashSet::new(),
            registered: HashSet::new(),
            hooks: Vec::new(),
        }
    }
}

impl HttpDispatch {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn admit_template(&mut self, path: &str) -> Result<(), DispatchError> {
        if self.paths.contains(path) {
            return Ok(());
        }
        self.templates.insert(path, ()).map_err(|e| match e {
            matchit::InsertError::Conflict { with } => DispatchError::Overlap {
                path: path.to_string(),
                existing: with,
            },
            other => DispatchError::InvalidPath {
                path: path.to_string(),
                reason: other.to_string(),
            },
        })?;
        self.paths.insert(path.to_string());
        Ok(())
    }

    /// Attach a handler for `method path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the method cannot be routed, the path is invalid,
    /// or the pair is already taken. The table is unchanged on error.
    pub fn register(
        &mut self,
        method: HttpMethod,
        path: &str,
        handler: RequestHandler,
    ) -> Result<(), DispatchError> {
        let filter = method
            .filter()
            .ok_or(DispatchError::UnsupportedMethod(method))?;
        validate_path(path).map_err(|reason| DispatchError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        })?;
        if self.registered.contains(&(method, path.to_string())) {
            return Err(DispatchError::Conflict {
                method,
                path: path.to_string(),
            });
        }
        self.admit_template(path)?;
        self.registered.insert((method, path.to_string()));

        let endpoint = on(
            filter,
            move |params: Option<RawPathParams>, request: Request| {
                let handler = Arc::clone(&handler);
                async move {
                    match into_inbound(params, request).await {
                        Ok(inbound) => handler(inbound).await,
                        Err(reply) => reply,
                    }
                }
            },
        );
        self.router = std::mem::take(&mut self.router).route(path, endpoint);
        Ok(())
    }

    /// Observe every request passing through the table.
    pub fn add_hook(&mut self, hook: Arc<dyn RequestHook>) {
        self.hooks.push(hook);
    }

    /// Check if a handler is registered for `method path`.
    #[must_use]
    pub fn contains(&self, method: HttpMethod, path: &str) -> bool {
        self.registered.contains(&(method, path.to_string()))
    }

    /// Number of registered `(method, path)` pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    /// Check if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Freeze the table into a servable router.
    #[must_use]
    pub fn into_router(self) -> Router {
        let hooks: Arc<[Arc<dyn RequestHook>]> = self.hooks.into();
        self.router
            .fallback(not_found_handler)
            .layer(middleware::from_fn_with_state(hooks, observe))
    }
}

async fn into_inbound(
    params: Option<RawPathParams>,
    request: Request,
) -> Result<InboundRequest, Reply> {
    let params = params
        .map(|p| {
            p.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| Reply::error(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string()))?;
    Ok(InboundRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        params,
        body,
    })
}

async fn observe(
    State(hooks): State<Arc<[Arc<dyn RequestHook>]>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    info!("Incoming request: {} {}", method, uri);
    for hook in hooks.iter() {
        hook.on_request(&method, &uri);
    }

    let response = next.run(request).await;
    let status = response.status();
    if status.is_success() {
        info!("Response sent for: {} {} with status {}", method, uri, status.as_u16());
    } else {
        error!("Response sent for: {} {} with status {}", method, uri, status.as_u16());
    }
    for hook in hooks.iter() {
        hook.on_response(&method, &uri, status);
    }
    response
}

async fn not_found_handler(method: Method, uri: Uri) -> Reply {
    error!("Route not found: {} {}", method, uri);
    Reply::not_found()
}

/// A running HTTP listener.
pub struct HttpListener {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl HttpListener {
    /// Bind `addr` and start serving `router` in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });

        info!("HTTP listener bound on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    /// The bound address (resolves port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, finish in-flight requests, and wait for the server task.
    ///
    /// # Errors
    ///
    /// Returns an error if the server task failed.
    pub async fn close(self) -> Result<(), TransportError> {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(result) => result.map_err(TransportError::Io),
            Err(e) => Err(TransportError::Other(format!("HTTP server task failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn echo_handler() -> RequestHandler {
        Arc::new(|req: InboundRequest| {
            async move {
                let id = req.param("id").unwrap_or("none").to_string();
                Reply::text(format!("{}:{}", id, String::from_utf8_lossy(&req.body)))
            }
            .boxed()
        })
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("PATCH".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("BREW".parse::<HttpMethod>().is_err());
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_path("/countries").is_ok());
        assert!(validate_path("/users/:id").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("countries").is_err());
        assert!(validate_path("/a b").is_err());
        assert!(validate_path("/a//b").is_err());
    }

    #[test]
    fn test_register_rejects_connect_and_conflicts() {
        let mut table = HttpDispatch::new();
        assert!(matches!(
            table.register(HttpMethod::Connect, "/tunnel", echo_handler()),
            Err(DispatchError::UnsupportedMethod(HttpMethod::Connect))
        ));

        table.register(HttpMethod::Get, "/items", echo_handler()).unwrap();
        assert!(matches!(
            table.register(HttpMethod::Get, "/items", echo_handler()),
            Err(DispatchError::Conflict { .. })
        ));
        // Same path, different method is a distinct pair.
        table.register(HttpMethod::Post, "/items", echo_handler()).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.contains(HttpMethod::Post, "/items"));
    }

    #[tokio::test]
    async fn test_register_rejects_unroutable_templates() {
        let mut table = HttpDispatch::new();
        table.register(HttpMethod::Get, "/users/:id", echo_handler()).unwrap();

        assert!(matches!(
            table.register(HttpMethod::Put, "/users/:name", echo_handler()),
            Err(DispatchError::Overlap { ref existing, .. }) if existing == "/users/:id"
        ));
        assert!(matches!(
            table.register(HttpMethod::Get, "/files/*rest/meta", echo_handler()),
            Err(DispatchError::InvalidPath { .. })
        ));
        assert!(matches!(
            table.register(HttpMethod::Get, "/users/:", echo_handler()),
            Err(DispatchError::InvalidPath { .. })
        ));
        assert_eq!(table.len(), 1);

        // The same template under another method still shares the entry.
        table.register(HttpMethod::Put, "/users/:id", echo_handler()).unwrap();
        table.register(HttpMethod::Get, "/files/*rest", echo_handler()).unwrap();
        assert_eq!(table.len(), 3);

        let response = table
            .into_router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/users/7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "7:");
    }

    #[tokio::test]
    async fn test_dispatch_with_params_and_body() {
        let mut table = HttpDispatch::new();
        table
            .register(HttpMethod::Post, "/items/:id", echo_handler())
            .unwrap();
        let app = table.into_router();

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/items/42")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "42:payload");
    }

    #[tokio::test]
    async fn test_unmatched_request_is_404() {
        let mut table = HttpDispatch::new();
        table.register(HttpMethod::Get, "/items", echo_handler()).unwrap();
        let app = table.into_router();

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, r#"{"error":"Route not found"}"#);
    }

    #[tokio::test]
    async fn test_hooks_observe_every_request() {
        struct Counter(AtomicUsize, AtomicUsize);
        impl RequestHook for Counter {
            fn on_request(&self, _method: &Method, _uri: &Uri) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn on_response(&self, _method: &Method, _uri: &Uri, status: StatusCode) {
                if status == StatusCode::NOT_FOUND {
                    self.1.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0), AtomicUsize::new(0)));
        let mut table = HttpDispatch::new();
        table.register(HttpMethod::Get, "/items", echo_handler()).unwrap();
        table.add_hook(counter.clone());
        let app = table.into_router();

        for uri in ["/items", "/missing"] {
            let request = axum::http::Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            app.clone().oneshot(request).await.unwrap();
        }

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(counter.1.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_bind_and_close() {
        let mut table = HttpDispatch::new();
        table.register(HttpMethod::Get, "/items", echo_handler()).unwrap();
        let listener = HttpListener::bind("127.0.0.1:0".parse().unwrap(), table.into_router())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        listener.close().await.unwrap();
    }
}
