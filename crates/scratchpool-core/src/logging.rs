//! Explicit logging context
//!
//! Components never reach for process-wide logger state. Each one is handed a
//! [`LogContext`] at construction and emits events with its span as explicit
//! parent, so a caller decides where pool activity is attributed.

use tracing::Span;

/// Span handle threaded through component constructors
#[derive(Debug, Clone)]
pub struct LogContext {
    span: Span,
}

impl LogContext {
    /// Wrap an existing span
    #[inline]
    #[must_use]
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    /// Root context for a pool operation
    #[must_use]
    pub fn root(operation: &str) -> Self {
        Self::new(tracing::info_span!("scratchpool", operation = %operation))
    }

    /// Context that records nothing
    #[inline]
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Span::none())
    }

    /// Child context for one component
    #[must_use]
    pub fn child(&self, component: &'static str) -> Self {
        Self::new(tracing::debug_span!(parent: &self.span, "component", name = component))
    }

    /// Span to use as event parent
    #[inline]
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::disabled()
    }
}
