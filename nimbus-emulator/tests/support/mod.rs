#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use nimbus_protocol::JsonCodec;
use nimbus_runtime::{
    Handler, InitFlow, InitHook, InvocationContext, Middleware, Next, Result, ResolverScope,
    ShutdownHook, typed_handler,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct Greeting {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Greeted {
    pub message: String,
}

/// Typed handler that greets by name.
pub fn greeter() -> Arc<dyn Handler> {
    Arc::new(typed_handler(JsonCodec, |event: Greeting| async move {
        Ok(Greeted {
            message: format!("Hello {}!", event.name),
        })
    }))
}

/// Handler that ignores its cancellation token and sleeps for `secs`
/// before responding. Used to provoke deadline enforcement.
pub struct SlowHandler {
    pub secs: u64,
}

#[async_trait]
impl Handler for SlowHandler {
    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<()> {
        tokio::time::sleep(std::time::Duration::from_secs(self.secs)).await;
        ctx.set_response(b"\"late\"".to_vec())
    }
}

/// Handler that signals when it has been entered, then sleeps far past
/// any deadline. Lets a test hold one invocation in flight while more
/// queue up behind it.
pub struct GatedHandler {
    pub entered: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl Handler for GatedHandler {
    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<()> {
        self.entered.notify_one();
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        ctx.set_response(b"\"late\"".to_vec())
    }
}

/// Middleware that appends labels around the inner stages.
pub struct Recording {
    pub label: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware for Recording {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Result<()> {
        self.log.lock().unwrap().push(format!("{}-before", self.label));
        let result = next.run(ctx).await;
        self.log.lock().unwrap().push(format!("{}-after", self.label));
        result
    }
}

/// Middleware that tracks how many invocations overlap.
pub struct OverlapProbe {
    pub current: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Middleware for OverlapProbe {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Result<()> {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let result = next.run(ctx).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Init hook that records its run and returns the configured flow.
pub struct ScriptedInit {
    pub label: &'static str,
    pub log: Arc<Mutex<Vec<&'static str>>>,
    pub flow: anyhow::Result<InitFlow>,
}

impl ScriptedInit {
    pub fn ok(label: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Self {
        Self {
            label,
            log,
            flow: Ok(InitFlow::Continue),
        }
    }
}

#[async_trait]
impl InitHook for ScriptedInit {
    async fn on_init(&self, _scope: &mut dyn ResolverScope) -> anyhow::Result<InitFlow> {
        self.log.lock().unwrap().push(self.label);
        match &self.flow {
            Ok(flow) => Ok(*flow),
            Err(err) => anyhow::bail!("{err}"),
        }
    }
}

/// Shutdown hook that counts its runs and optionally fails.
pub struct CountingShutdown {
    pub runs: Arc<AtomicUsize>,
    pub fail: bool,
}

#[async_trait]
impl ShutdownHook for CountingShutdown {
    async fn on_shutdown(
        &self,
        _scope: &mut dyn ResolverScope,
        _token: CancellationToken,
    ) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("flush failed")
        }
        Ok(())
    }
}
