//! Scoped dependency-resolution seam.
//!
//! The resolver concept is opaque to this core: each invocation and
//! each shutdown hook gets its own scope, and the runtime only needs
//! "create scope" / "dispose scope" from the collaborator. A real
//! dependency-injection container plugs in here; the default is a
//! no-op.

/// Per-invocation (or per-hook) dependency-resolution handle.
///
/// Released exactly once; the owning context guards against repeated
/// disposal.
#[cfg_attr(test, mockall::automock)]
pub trait ResolverScope: Send {
    /// Release the scope's resources.
    fn dispose(&mut self);
}

/// Creates resolver scopes. Shared across the whole host.
#[cfg_attr(test, mockall::automock)]
pub trait ScopeFactory: Send + Sync {
    /// Open a fresh scope. Never shared across invocations.
    fn create_scope(&self) -> Box<dyn ResolverScope>;
}

/// Stock factory for hosts without a dependency container.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScopeFactory;

impl ScopeFactory for NoopScopeFactory {
    fn create_scope(&self) -> Box<dyn ResolverScope> {
        Box::new(NoopScope)
    }
}

#[derive(Debug)]
struct NoopScope;

impl ResolverScope for NoopScope {
    fn dispose(&mut self) {}
}
