//! Startup and shutdown coordination.
//!
//! Init hooks run strictly in registration order, sequentially and
//! fail-fast; shutdown hooks fan out concurrently and fail soft, with
//! every outcome collected. A hook that requests a graceful stop is an
//! expected outcome, not an error, and is reported as
//! [`InitOutcome::HostExited`] instead of a thrown failure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nimbus_protocol::report::ErrorReport;

use crate::error::{ShutdownError, report_from_anyhow};
use crate::scope::{ResolverScope, ScopeFactory};

/// Host lifecycle phases. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecyclePhase {
    NotStarted,
    Initializing,
    Ready,
    ShuttingDown,
    Stopped,
}

/// What an init hook wants the host to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFlow {
    /// Proceed to the next hook (or start serving).
    Continue,
    /// Stop the host gracefully without serving traffic.
    ExitHost,
}

/// Result of the startup phase. Produced at most once per orchestrator.
#[derive(Debug, Clone)]
pub enum InitOutcome {
    /// All init hooks ran; the host may start serving.
    Completed,
    /// `initialize` had already been driven to completion earlier.
    AlreadyCompleted,
    /// An init hook failed; the host never serves traffic.
    Error(ErrorReport),
    /// An init hook requested a graceful stop. Not an error.
    HostExited,
}

/// Startup hook, run once before the bootstrap loop starts.
#[async_trait]
pub trait InitHook: Send + Sync {
    /// Runs under a fresh resolver scope. Returning an error halts the
    /// init sequence; returning [`InitFlow::ExitHost`] stops the host
    /// without error.
    async fn on_init(&self, scope: &mut dyn ResolverScope) -> anyhow::Result<InitFlow>;
}

/// Shutdown hook, run once after the bootstrap loop stops.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    /// Runs under a fresh resolver scope. The token is deadline-bounded
    /// and should be respected; a hook that ignores it is abandoned
    /// once the deadline passes.
    async fn on_shutdown(
        &self,
        scope: &mut dyn ResolverScope,
        token: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Grace period after the shutdown deadline for hooks that observe the
/// cancellation and need a moment to return.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Runs registered startup hooks sequentially (fail-fast) and shutdown
/// hooks concurrently (fail-soft, aggregating every failure).
pub struct LifecycleOrchestrator {
    init_hooks: Vec<Arc<dyn InitHook>>,
    shutdown_hooks: Vec<Arc<dyn ShutdownHook>>,
    scopes: Arc<dyn ScopeFactory>,
    shutdown_deadline: Duration,
    phase: LifecyclePhase,
}

impl LifecycleOrchestrator {
    /// New orchestrator with no hooks registered.
    pub fn new(scopes: Arc<dyn ScopeFactory>, shutdown_deadline: Duration) -> Self {
        Self {
            init_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
            scopes,
            shutdown_deadline,
            phase: LifecyclePhase::NotStarted,
        }
    }

    /// Register an init hook. Hooks run in registration order.
    pub fn register_init(&mut self, hook: Arc<dyn InitHook>) {
        self.init_hooks.push(hook);
    }

    /// Register a shutdown hook. Hooks have no ordering guarantee among
    /// themselves but are all attempted.
    pub fn register_shutdown(&mut self, hook: Arc<dyn ShutdownHook>) {
        self.shutdown_hooks.push(hook);
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Run the init hooks. The first hook to fail or to signal a stop
    /// halts the sequence; later hooks never run.
    pub async fn initialize(&mut self) -> InitOutcome {
        if self.phase != LifecyclePhase::NotStarted {
            return InitOutcome::AlreadyCompleted;
        }
        self.phase = LifecyclePhase::Initializing;

        for (index, hook) in self.init_hooks.iter().enumerate() {
            let mut scope = self.scopes.create_scope();
            let result = hook.on_init(scope.as_mut()).await;
            scope.dispose();
            match result {
                Ok(InitFlow::Continue) => debug!(hook = index, "init hook completed"),
                Ok(InitFlow::ExitHost) => {
                    info!(hook = index, "init hook requested graceful host exit");
                    self.phase = LifecyclePhase::Stopped;
                    return InitOutcome::HostExited;
                }
                Err(err) => {
                    error!(hook = index, error = %err, "init hook failed");
                    self.phase = LifecyclePhase::Stopped;
                    return InitOutcome::Error(report_from_anyhow("Nimbus.InitError", &err));
                }
            }
        }

        self.phase = LifecyclePhase::Ready;
        InitOutcome::Completed
    }

    /// Run the shutdown hooks. All hooks are started concurrently, each
    /// under its own resolver scope and a shared deadline-bounded
    /// cancellation token; every outcome is collected. Hooks that
    /// outrun the deadline are recorded as late and abandoned rather
    /// than blocking indefinitely.
    pub async fn shutdown(&mut self) -> Result<(), ShutdownError> {
        if self.phase != LifecyclePhase::Ready {
            // Either init never completed or shutdown already ran;
            // hooks run at most once.
            return Ok(());
        }
        self.phase = LifecyclePhase::ShuttingDown;

        let deadline = tokio::time::Instant::now() + self.shutdown_deadline;
        let token = CancellationToken::new();
        let watchdog = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                token.cancel();
            })
        };

        let mut hooks: JoinSet<Result<(), ErrorReport>> = JoinSet::new();
        for hook in &self.shutdown_hooks {
            let hook = Arc::clone(hook);
            let token = token.clone();
            let mut scope = self.scopes.create_scope();
            hooks.spawn(async move {
                let result = hook.on_shutdown(scope.as_mut(), token).await;
                scope.dispose();
                result.map_err(|err| report_from_anyhow("Nimbus.ShutdownError", &err))
            });
        }

        let mut failures = Vec::new();
        let hard_stop = deadline + SHUTDOWN_GRACE;
        while !hooks.is_empty() {
            match tokio::time::timeout_at(hard_stop, hooks.join_next()).await {
                Ok(Some(Ok(Ok(())))) => {}
                Ok(Some(Ok(Err(report)))) => failures.push(report),
                Ok(Some(Err(join_err))) => failures.push(ErrorReport::new(
                    "Nimbus.ShutdownError",
                    format!("shutdown hook panicked: {join_err}"),
                )),
                Ok(None) => break,
                Err(_) => {
                    let stragglers = hooks.len();
                    warn!(
                        stragglers,
                        "shutdown hooks did not complete within the shutdown deadline"
                    );
                    failures.push(ErrorReport::new(
                        "Nimbus.ShutdownTimeout",
                        format!(
                            "{stragglers} shutdown hook(s) did not complete within the shutdown deadline"
                        ),
                    ));
                    hooks.detach_all();
                    break;
                }
            }
        }
        watchdog.abort();

        self.phase = LifecyclePhase::Stopped;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }
}

impl fmt::Debug for LifecycleOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleOrchestrator")
            .field("init_hooks", &self.init_hooks.len())
            .field("shutdown_hooks", &self.shutdown_hooks.len())
            .field("shutdown_deadline", &self.shutdown_deadline)
            .field("phase", &self.phase)
            .finish()
    }
}
