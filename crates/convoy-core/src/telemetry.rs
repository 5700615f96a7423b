//! Injected tracing context.
//!
//! Components take a [`Tracer`] at construction instead of reaching for a global;
//! the subscriber itself is installed by the binary.

use tracing::{Span, info_span};

#[derive(Debug, Clone)]
pub struct Tracer {
    root: Span,
}

impl Tracer {
    pub fn new(component: &'static str) -> Self {
        Self {
            root: info_span!("convoy", component),
        }
    }

    /// A tracer whose spans are never recorded.
    pub fn disabled() -> Self {
        Self { root: Span::none() }
    }

    pub fn root(&self) -> &Span {
        &self.root
    }

    /// Span for one operation, nested under this tracer's root.
    pub fn span(&self, operation: &'static str) -> Span {
        info_span!(parent: &self.root, "op", operation)
    }

    /// Tracer for a sub-component sharing this root.
    pub fn child(&self, component: &'static str) -> Self {
        Self {
            root: info_span!(parent: &self.root, "convoy", component),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::disabled()
    }
}
