//! In-process runtime: a real [`RuntimeHost`] wired to an emulated
//! control plane over loopback HTTP.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use nimbus_protocol::{Codec, ErrorReport, Invocation, JsonCodec};
use nimbus_runtime::{
    Handler, InitHook, InitOutcome, Middleware, NoopScopeFactory, RuntimeConfig, RuntimeError,
    RuntimeHost, ScopeFactory, ShutdownError, ShutdownHook,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{Completion, DispatchCore};
use crate::error::EmulatorError;
use crate::server::bind_wire;
use crate::state::ServerState;

const DEFAULT_FUNCTION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DEADLINE_BUFFER: Duration = Duration::from_millis(100);
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

/// Configures a [`LocalRuntime`].
pub struct LocalRuntimeBuilder<C: Codec = JsonCodec> {
    codec: C,
    function_timeout: Duration,
    deadline_buffer: Duration,
    shutdown_deadline: Duration,
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Option<Arc<dyn Handler>>,
    init_hooks: Vec<Arc<dyn InitHook>>,
    shutdown_hooks: Vec<Arc<dyn ShutdownHook>>,
    scopes: Arc<dyn ScopeFactory>,
}

impl LocalRuntimeBuilder<JsonCodec> {
    /// Builder with JSON payloads and default timings.
    pub fn new() -> Self {
        Self {
            codec: JsonCodec,
            function_timeout: DEFAULT_FUNCTION_TIMEOUT,
            deadline_buffer: DEFAULT_DEADLINE_BUFFER,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            middlewares: Vec::new(),
            terminal: None,
            init_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
            scopes: Arc::new(NoopScopeFactory),
        }
    }
}

impl Default for LocalRuntimeBuilder<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> LocalRuntimeBuilder<C> {
    /// Swap the payload codec.
    pub fn codec<D: Codec>(self, codec: D) -> LocalRuntimeBuilder<D> {
        LocalRuntimeBuilder {
            codec,
            function_timeout: self.function_timeout,
            deadline_buffer: self.deadline_buffer,
            shutdown_deadline: self.shutdown_deadline,
            middlewares: self.middlewares,
            terminal: self.terminal,
            init_hooks: self.init_hooks,
            shutdown_hooks: self.shutdown_hooks,
            scopes: self.scopes,
        }
    }

    /// How long an invocation may run before the deadline passes.
    pub fn function_timeout(mut self, timeout: Duration) -> Self {
        self.function_timeout = timeout;
        self
    }

    /// Buffer subtracted from the deadline when deriving the
    /// cancellation token.
    pub fn deadline_buffer(mut self, buffer: Duration) -> Self {
        self.deadline_buffer = buffer;
        self
    }

    /// Time budget granted to shutdown hooks.
    pub fn shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    /// Append a middleware stage; the first appended is the outermost.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Set the terminal handler. Required.
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.terminal = Some(handler);
        self
    }

    /// Register an init hook.
    pub fn on_init(mut self, hook: Arc<dyn InitHook>) -> Self {
        self.init_hooks.push(hook);
        self
    }

    /// Register a shutdown hook.
    pub fn on_shutdown(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.shutdown_hooks.push(hook);
        self
    }

    /// Plug in a resolver-scope factory.
    pub fn scope_factory(mut self, scopes: Arc<dyn ScopeFactory>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Assemble the emulator. Fails if no handler was set.
    pub fn build(self) -> Result<LocalRuntime<C>, EmulatorError> {
        let terminal = self.terminal.ok_or_else(|| {
            EmulatorError::InvalidState("a terminal handler is required".into())
        })?;
        Ok(LocalRuntime {
            codec: self.codec,
            function_timeout: self.function_timeout,
            core: Arc::new(DispatchCore::new()),
            inner: tokio::sync::Mutex::new(Inner {
                state: ServerState::Created,
                plan: Some(HostPlan {
                    middlewares: self.middlewares,
                    terminal,
                    init_hooks: self.init_hooks,
                    shutdown_hooks: self.shutdown_hooks,
                    scopes: self.scopes,
                    deadline_buffer: self.deadline_buffer,
                    shutdown_deadline: self.shutdown_deadline,
                }),
                addr: None,
                host_token: None,
                host_task: None,
                server_token: None,
                server_task: None,
            }),
        })
    }
}

impl<C: Codec> fmt::Debug for LocalRuntimeBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRuntimeBuilder")
            .field("function_timeout", &self.function_timeout)
            .field("middlewares", &self.middlewares.len())
            .field("has_handler", &self.terminal.is_some())
            .finish()
    }
}

/// Per-invocation overrides for [`LocalRuntime::invoke_raw`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Trace id passed through to the handler context.
    pub trace_id: Option<String>,
    /// Function identity passed through to the handler context.
    pub function_arn: Option<String>,
    /// Absolute deadline, overriding the configured function timeout.
    pub deadline: Option<DateTime<Utc>>,
}

impl InvokeOptions {
    /// Attach a trace id.
    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Override the deadline for this one invocation.
    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Decoded outcome of one invocation.
#[derive(Debug, Clone)]
pub struct InvocationResult<T> {
    /// Decoded response, when the invocation succeeded with a body.
    pub response: Option<T>,
    /// Structured report, when the invocation failed.
    pub error: Option<ErrorReport>,
}

impl<T> InvocationResult<T> {
    /// Whether the invocation completed without an error report.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Categorical error type, when the invocation failed.
    pub fn error_type(&self) -> Option<&str> {
        self.error.as_ref().map(|report| report.error_type.as_str())
    }
}

struct HostPlan {
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Arc<dyn Handler>,
    init_hooks: Vec<Arc<dyn InitHook>>,
    shutdown_hooks: Vec<Arc<dyn ShutdownHook>>,
    scopes: Arc<dyn ScopeFactory>,
    deadline_buffer: Duration,
    shutdown_deadline: Duration,
}

struct Inner {
    state: ServerState,
    plan: Option<HostPlan>,
    addr: Option<SocketAddr>,
    host_token: Option<CancellationToken>,
    host_task: Option<JoinHandle<HostRunOutcome>>,
    server_token: Option<CancellationToken>,
    server_task: Option<JoinHandle<()>>,
}

struct HostRunOutcome {
    serve: Result<(), RuntimeError>,
    shutdown: Result<(), ShutdownError>,
}

/// An emulated control plane with a hosted runtime behind it.
///
/// Starts lazily on the first invocation; `stop` runs the shutdown
/// hooks and surfaces their aggregated failures.
pub struct LocalRuntime<C: Codec = JsonCodec> {
    codec: C,
    function_timeout: Duration,
    core: Arc<DispatchCore>,
    inner: tokio::sync::Mutex<Inner>,
}

impl LocalRuntime<JsonCodec> {
    /// Start building a JSON-speaking emulator.
    pub fn builder() -> LocalRuntimeBuilder<JsonCodec> {
        LocalRuntimeBuilder::new()
    }
}

impl<C: Codec> LocalRuntime<C> {
    /// Bind the wire, initialize the hosted runtime, and begin serving.
    ///
    /// Invoking also starts the emulator implicitly; calling this is
    /// only needed to observe init failures eagerly.
    pub async fn start(&self) -> Result<(), EmulatorError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ServerState::Created => self.start_locked(&mut inner).await,
            ServerState::Running => Ok(()),
            state => Err(EmulatorError::InvalidState(format!(
                "cannot start while {state}"
            ))),
        }
    }

    /// Serialize `event`, run it through the hosted runtime, and decode
    /// the outcome.
    pub async fn invoke<T, R>(&self, event: &T) -> Result<InvocationResult<R>, EmulatorError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = self.codec.serialize(event)?;
        match self.invoke_raw(payload, InvokeOptions::default()).await? {
            Completion::Response(bytes) => {
                let response = if bytes.is_empty() {
                    None
                } else {
                    Some(self.codec.deserialize(&bytes)?)
                };
                Ok(InvocationResult { response, error: None })
            }
            Completion::Error(report) => Ok(InvocationResult {
                response: None,
                error: Some(report),
            }),
        }
    }

    /// Invoke with a `null` event, returning the raw response body.
    pub async fn invoke_no_event(&self) -> Result<InvocationResult<Vec<u8>>, EmulatorError> {
        match self
            .invoke_raw(b"null".to_vec(), InvokeOptions::default())
            .await?
        {
            Completion::Response(bytes) => Ok(InvocationResult {
                response: Some(bytes),
                error: None,
            }),
            Completion::Error(report) => Ok(InvocationResult {
                response: None,
                error: Some(report),
            }),
        }
    }

    /// Submit a raw payload and wait for its completion.
    pub async fn invoke_raw(
        &self,
        payload: Vec<u8>,
        options: InvokeOptions,
    ) -> Result<Completion, EmulatorError> {
        self.ensure_started().await?;
        let deadline = options
            .deadline
            .unwrap_or_else(|| Utc::now() + timeout_delta(self.function_timeout));
        let invocation = Invocation {
            id: Uuid::new_v4().to_string(),
            deadline,
            payload,
            trace_id: options.trace_id,
            function_arn: options.function_arn,
        };
        debug!(invocation_id = %invocation.id, "submitting invocation");
        let rx = self.core.submit(invocation)?;
        rx.await.map_err(|_| EmulatorError::ChannelClosed)
    }

    /// Stop serving: cancel the hosted runtime, run its shutdown hooks,
    /// and tear down the wire listener. Idempotent once stopped.
    pub async fn stop(&self) -> Result<(), EmulatorError> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, ServerState::Stopped | ServerState::Disposed) {
            return Ok(());
        }
        inner.state.advance(ServerState::Stopped)?;
        let (serve, shutdown) = halt(&self.core, &mut inner).await;
        shutdown?;
        serve?;
        Ok(())
    }

    /// Tear everything down, swallowing late errors. Idempotent.
    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ServerState::Disposed {
            return;
        }
        let (serve, shutdown) = halt(&self.core, &mut inner).await;
        if let Err(err) = shutdown {
            warn!(error = %err, "shutdown failures discarded during dispose");
        }
        if let Err(err) = serve {
            warn!(error = %err, "serve failure discarded during dispose");
        }
        // Disposal is legal from every state.
        let _ = inner.state.advance(ServerState::Disposed);
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ServerState {
        self.inner.lock().await.state
    }

    /// Loopback address the wire protocol is bound on, once started.
    pub async fn wire_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.addr
    }

    /// Init error the hosted runtime reported over the wire, if any.
    pub fn reported_init_error(&self) -> Option<ErrorReport> {
        self.core.reported_init_error()
    }

    async fn ensure_started(&self) -> Result<(), EmulatorError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ServerState::Running => Ok(()),
            ServerState::Created => {
                self.start_locked(&mut inner).await?;
                // An init hook may have opted out of serving; without a
                // running host a submitted invocation would never be
                // polled.
                if inner.state != ServerState::Running {
                    return Err(EmulatorError::InvalidState(
                        "the host stopped during initialization".into(),
                    ));
                }
                Ok(())
            }
            state => Err(EmulatorError::InvalidState(format!(
                "cannot invoke while {state}"
            ))),
        }
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<(), EmulatorError> {
        inner.state.advance(ServerState::Starting)?;
        let plan = inner
            .plan
            .take()
            .ok_or_else(|| EmulatorError::InvalidState("host plan already consumed".into()))?;
        let (addr, server_token, server_task) = bind_wire(Arc::clone(&self.core)).await?;
        inner.addr = Some(addr);
        inner.server_token = Some(server_token);
        inner.server_task = Some(server_task);

        let config = RuntimeConfig::new(format!("http://{addr}"))
            .with_deadline_buffer(plan.deadline_buffer)
            .with_shutdown_deadline(plan.shutdown_deadline);
        let host_token = CancellationToken::new();
        let mut builder = RuntimeHost::builder(config)
            .handler(plan.terminal)
            .scope_factory(plan.scopes)
            .host_token(host_token.clone());
        for middleware in plan.middlewares {
            builder = builder.middleware(middleware);
        }
        for hook in plan.init_hooks {
            builder = builder.on_init(hook);
        }
        for hook in plan.shutdown_hooks {
            builder = builder.on_shutdown(hook);
        }
        let host = builder.build()?;

        let (init_tx, init_rx) = oneshot::channel();
        inner.host_token = Some(host_token);
        inner.host_task = Some(tokio::spawn(run_host(host, init_tx)));

        match init_rx.await {
            Ok(InitOutcome::Completed | InitOutcome::AlreadyCompleted) => {
                inner.state.advance(ServerState::Running)?;
                Ok(())
            }
            Ok(InitOutcome::HostExited) => {
                // Graceful opt-out during init: stop cleanly.
                let _ = halt(&self.core, inner).await;
                inner.state.advance(ServerState::Stopped)?;
                Ok(())
            }
            Ok(outcome) => {
                let _ = halt(&self.core, inner).await;
                inner.state.advance(ServerState::Stopped)?;
                Err(EmulatorError::InitFailed(outcome))
            }
            Err(_) => Err(EmulatorError::ChannelClosed),
        }
    }
}

impl<C: Codec> fmt::Debug for LocalRuntime<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("function_timeout", &self.function_timeout)
            .field("in_flight", &self.core.in_flight())
            .finish()
    }
}

/// Cancel and reap both background tasks, in dependency order: the
/// host first (it needs the wire alive to drain its shutdown reports),
/// then the listener. Finally closes the dispatch core, failing any
/// invocation the host never got to poll.
async fn halt(
    core: &DispatchCore,
    inner: &mut Inner,
) -> (Result<(), RuntimeError>, Result<(), ShutdownError>) {
    if let Some(token) = inner.host_token.take() {
        token.cancel();
    }
    let mut serve = Ok(());
    let mut shutdown = Ok(());
    if let Some(task) = inner.host_task.take() {
        if let Ok(outcome) = task.await {
            serve = outcome.serve;
            shutdown = outcome.shutdown;
        }
    }
    if let Some(token) = inner.server_token.take() {
        token.cancel();
    }
    if let Some(task) = inner.server_task.take() {
        let _ = task.await;
    }
    core.close();
    (serve, shutdown)
}

async fn run_host(mut host: RuntimeHost, init_tx: oneshot::Sender<InitOutcome>) -> HostRunOutcome {
    let outcome = host.initialize().await;
    let proceed = matches!(
        outcome,
        InitOutcome::Completed | InitOutcome::AlreadyCompleted
    );
    let _ = init_tx.send(outcome);
    let serve = if proceed { host.serve().await } else { Ok(()) };
    let shutdown = host.shutdown().await;
    HostRunOutcome { serve, shutdown }
}

fn timeout_delta(timeout: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(timeout.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_a_handler() {
        let err = LocalRuntime::builder().build().unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidState(_)));
    }

    #[test]
    fn result_helpers_reflect_the_error_slot() {
        let ok: InvocationResult<()> = InvocationResult {
            response: None,
            error: None,
        };
        assert!(ok.is_success());
        assert_eq!(ok.error_type(), None);

        let failed: InvocationResult<()> = InvocationResult {
            response: None,
            error: Some(ErrorReport::new("Nimbus.HandlerError", "boom")),
        };
        assert!(!failed.is_success());
        assert_eq!(failed.error_type(), Some("Nimbus.HandlerError"));
    }

    #[test]
    fn timeout_delta_saturates() {
        assert_eq!(
            timeout_delta(Duration::from_secs(1)),
            chrono::Duration::seconds(1)
        );
        assert_eq!(
            timeout_delta(Duration::MAX),
            chrono::Duration::milliseconds(i64::MAX)
        );
    }
}
