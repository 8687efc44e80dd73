//! The ordered set of routes a service exposes.

use crate::route::{Route, RouteDescriptor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Duplicate route id: {0}")]
    DuplicateRouteId(String),
}

/// Routes in registration order. Ids are unique.
///
/// Binding follows registration order, and so does unbinding.
#[derive(Default)]
pub struct RouteRegistry {
    routes: Vec<Box<dyn Route>>,
}

impl RouteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateRouteId`] if a route with the same id
    /// is already registered; the registry is unchanged.
    pub fn register(&mut self, route: impl Route + 'static) -> Result<&mut Self, RegistryError> {
        self.register_boxed(Box::new(route))
    }

    /// Add an already boxed route.
    ///
    /// # Errors
    ///
    /// See [`RouteRegistry::register`].
    pub fn register_boxed(&mut self, route: Box<dyn Route>) -> Result<&mut Self, RegistryError> {
        let id = route.descriptor().id();
        if self.contains(id) {
            return Err(RegistryError::DuplicateRouteId(id.to_string()));
        }
        self.routes.push(route);
        Ok(self)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.routes.iter().any(|r| r.descriptor().id() == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &RouteDescriptor> {
        self.routes.iter().map(|r| r.descriptor())
    }

    pub(crate) fn routes(&self) -> &[Box<dyn Route>] {
        &self.routes
    }
}
