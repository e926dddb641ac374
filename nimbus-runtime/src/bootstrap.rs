//! The bootstrap loop: poll, dispatch, report, repeat.
//!
//! One iteration per invocation. Invocation-scoped failures are caught
//! at this boundary and converted to a structured error report; the
//! loop never lets one bad invocation crash the process. Only host
//! cancellation or a protocol violation terminates the loop, after
//! which shutdown hooks run.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nimbus_protocol::Invocation;

use crate::client::ControlPlaneClient;
use crate::config::RuntimeConfig;
use crate::context::InvocationContext;
use crate::deadline::DeadlineTokenFactory;
use crate::error::{Result, RuntimeError, ShutdownError};
use crate::lifecycle::{InitHook, InitOutcome, LifecycleOrchestrator, ShutdownHook};
use crate::pipeline::{Handler, Middleware, Pipeline};
use crate::scope::{NoopScopeFactory, ScopeFactory};

/// Builder for a [`RuntimeHost`].
pub struct RuntimeHostBuilder {
    config: RuntimeConfig,
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Option<Arc<dyn Handler>>,
    init_hooks: Vec<Arc<dyn InitHook>>,
    shutdown_hooks: Vec<Arc<dyn ShutdownHook>>,
    scopes: Arc<dyn ScopeFactory>,
    host_token: CancellationToken,
}

impl RuntimeHostBuilder {
    /// Start building a host for the given configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            middlewares: Vec::new(),
            terminal: None,
            init_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
            scopes: Arc::new(NoopScopeFactory),
            host_token: CancellationToken::new(),
        }
    }

    /// Append a middleware stage. The first appended stage is the
    /// outermost.
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

    /// Use an externally owned host cancellation token (e.g. wired to a
    /// termination signal).
    pub fn host_token(mut self, token: CancellationToken) -> Self {
        self.host_token = token;
        self
    }

    /// Assemble the host. Fails if no terminal handler was set.
    pub fn build(self) -> Result<RuntimeHost> {
        let terminal = self.terminal.ok_or_else(|| {
            RuntimeError::InvalidState("a terminal handler is required".into())
        })?;
        let pipeline = Pipeline::build(terminal, self.middlewares);
        let mut lifecycle =
            LifecycleOrchestrator::new(Arc::clone(&self.scopes), self.config.shutdown_deadline);
        for hook in self.init_hooks {
            lifecycle.register_init(hook);
        }
        for hook in self.shutdown_hooks {
            lifecycle.register_shutdown(hook);
        }
        Ok(RuntimeHost {
            pipeline,
            client: ControlPlaneClient::new(self.config.endpoint.clone()),
            deadlines: DeadlineTokenFactory::new(self.config.deadline_buffer),
            scopes: self.scopes,
            lifecycle,
            host_token: self.host_token,
        })
    }
}

impl fmt::Debug for RuntimeHostBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHostBuilder")
            .field("config", &self.config)
            .field("middlewares", &self.middlewares.len())
            .field("has_handler", &self.terminal.is_some())
            .field("init_hooks", &self.init_hooks.len())
            .field("shutdown_hooks", &self.shutdown_hooks.len())
            .finish()
    }
}

/// The process-level control loop.
///
/// Exactly one invocation is in flight at a time: the loop does not
/// poll again until the previous outcome is fully reported.
pub struct RuntimeHost {
    pipeline: Pipeline,
    client: ControlPlaneClient,
    deadlines: DeadlineTokenFactory,
    scopes: Arc<dyn ScopeFactory>,
    lifecycle: LifecycleOrchestrator,
    host_token: CancellationToken,
}

impl RuntimeHost {
    /// Start building a host.
    pub fn builder(config: RuntimeConfig) -> RuntimeHostBuilder {
        RuntimeHostBuilder::new(config)
    }

    /// Token that stops the loop when cancelled.
    pub fn host_token(&self) -> CancellationToken {
        self.host_token.clone()
    }

    /// Run the init hooks. On failure the error is also reported to the
    /// control plane's init-error endpoint.
    pub async fn initialize(&mut self) -> InitOutcome {
        let outcome = self.lifecycle.initialize().await;
        if let InitOutcome::Error(report) = &outcome {
            if let Err(err) = self.client.post_init_error(report).await {
                warn!(error = %err, "failed to report the init error to the control plane");
            }
        }
        outcome
    }

    /// Poll and serve invocations until the host token is cancelled or
    /// the control-plane interaction becomes unrecoverable.
    pub async fn serve(&mut self) -> Result<()> {
        info!(endpoint = %self.client.endpoint(), "bootstrap loop started");
        loop {
            let invocation = tokio::select! {
                _ = self.host_token.cancelled() => {
                    info!("host cancellation observed; leaving the poll loop");
                    return Ok(());
                }
                polled = self.client.next_invocation() => match polled {
                    Ok(invocation) => invocation,
                    Err(err) => {
                        if self.host_token.is_cancelled() {
                            // The connection was torn down by shutdown.
                            return Ok(());
                        }
                        error!(error = %err, "next-invocation poll failed; terminating the loop");
                        return Err(err);
                    }
                },
            };
            self.dispatch(invocation).await?;
        }
    }

    /// Run the shutdown hooks.
    pub async fn shutdown(&mut self) -> std::result::Result<(), ShutdownError> {
        self.lifecycle.shutdown().await
    }

    /// Initialize, serve, then shut down. Convenience for binaries.
    pub async fn run(mut self) -> anyhow::Result<()> {
        match self.initialize().await {
            InitOutcome::Completed | InitOutcome::AlreadyCompleted => {}
            InitOutcome::HostExited => {
                info!("an init hook requested a graceful host exit");
                return Ok(());
            }
            InitOutcome::Error(report) => {
                anyhow::bail!("initialization failed: {}", report.error_message)
            }
        }
        let served = self.serve().await;
        if let Err(err) = self.shutdown().await {
            for failure in &err.failures {
                error!(
                    error_type = %failure.error_type,
                    message = %failure.error_message,
                    "shutdown hook failed"
                );
            }
            served?;
            return Err(err.into());
        }
        served?;
        Ok(())
    }

    /// Drive one invocation through the pipeline and report its outcome.
    async fn dispatch(&mut self, invocation: Invocation) -> Result<()> {
        let id = invocation.id.clone();
        let token = self.deadlines.token(invocation.deadline, &self.host_token);
        let scope = self.scopes.create_scope();
        let mut ctx = InvocationContext::new(invocation, token.clone(), scope);

        let outcome: Result<Option<Vec<u8>>> = if token.is_cancelled() {
            // Deadline already unreachable: fail fast, never run the
            // handler.
            ctx.dispose();
            Err(RuntimeError::Timeout)
        } else {
            let pipeline = self.pipeline.clone();
            let mut in_flight = tokio::spawn(async move {
                let result = pipeline.invoke(&mut ctx).await;
                (ctx, result)
            });
            tokio::select! {
                joined = &mut in_flight => match joined {
                    Ok((mut ctx, Ok(()))) => {
                        let response = ctx.take_response();
                        ctx.dispose();
                        Ok(response)
                    }
                    Ok((mut ctx, Err(err))) => {
                        ctx.dispose();
                        Err(err)
                    }
                    Err(join_err) => Err(RuntimeError::Handler(anyhow::anyhow!(
                        "handler task panicked: {join_err}"
                    ))),
                },
                _ = token.cancelled() => {
                    // Abandon the handler; dropping its task releases
                    // the context and with it the resolver scope.
                    in_flight.abort();
                    Err(RuntimeError::Timeout)
                }
            }
        };

        match outcome {
            Ok(Some(body)) => {
                debug!(invocation_id = %id, response_len = body.len(), "invocation succeeded");
                self.client.post_response(&id, body).await?;
            }
            Ok(None) => {
                debug!(invocation_id = %id, "invocation succeeded with an empty response");
                self.client.post_response(&id, Vec::new()).await?;
            }
            Err(err) => {
                let report = err.to_report();
                warn!(
                    invocation_id = %id,
                    error_type = %report.error_type,
                    message = %report.error_message,
                    "invocation failed"
                );
                self.client.post_error(&id, &report).await?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RuntimeHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHost")
            .field("endpoint", &self.client.endpoint())
            .field("pipeline", &self.pipeline)
            .field("lifecycle", &self.lifecycle)
            .field("host_cancelled", &self.host_token.is_cancelled())
            .finish()
    }
}
