//! Typed pipeline stages.
//!
//! A stage is an asynchronous, fallible transform from one type to the next.
//! Routes chain stages end to end, so a mismatch between what one stage
//! produces and what the next accepts is a compile error.

use crate::codec::BoxError;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// A shareable pipeline stage from `I` to `O`.
pub type Stage<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, BoxError>> + Send + Sync>;

/// Wrap an async function as a [`Stage`].
///
/// Any error type convertible into [`BoxError`] is accepted, including
/// `anyhow::Error`.
pub fn stage<I, O, E, F, Fut>(f: F) -> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Into<BoxError>,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
{
    Arc::new(move |input| {
        let fut = f(input);
        async move { fut.await.map_err(Into::<BoxError>::into) }.boxed()
    })
}

/// The pass-through stage used when a route declares no `process` stage.
pub(crate) fn identity<T: Send + 'static>() -> Stage<T, T> {
    Arc::new(|input| future::ready(Ok::<T, BoxError>(input)).boxed())
}

/// Names of the pipeline stages, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    Extract,
    Process,
    Respond,
    Consume,
    Produce,
    /// Handing the produced payload to the broker.
    Publish,
}

impl StageName {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Extract => "extract",
            StageName::Process => "process",
            StageName::Respond => "respond",
            StageName::Consume => "consume",
            StageName::Produce => "produce",
            StageName::Publish => "publish",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage failure, tagged with the route and stage it came from.
#[derive(Debug, Error)]
#[error("route {route}: {stage} stage failed: {source}")]
pub struct PipelineError {
    pub route: String,
    pub stage: StageName,
    #[source]
    pub source: BoxError,
}

impl PipelineError {
    #[must_use]
    pub fn new(route: &str, stage: StageName, source: impl Into<BoxError>) -> Self {
        Self {
            route: route.to_string(),
            stage,
            source: source.into(),
        }
    }
}
