//! Middleware composition around the terminal handler.
//!
//! The pipeline is composed once at startup into an immutable chain
//! and passed by reference into the bootstrap loop; there is no
//! ambient registration. Composition wraps right-to-left so the first
//! registered middleware is the outermost: it observes the invocation
//! before and after every inner stage, including errors propagating
//! up from the terminal handler.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};

use nimbus_protocol::codec::Codec;

use crate::context::InvocationContext;
use crate::error::{Result, RuntimeError};

/// Terminal invocation delegate, already bound to user logic.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the handler for one invocation.
    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<()>;
}

/// One stage of the pipeline. Stages are composed once and reused
/// across all invocations; they must not carry per-invocation mutable
/// state of their own.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Observe the invocation and delegate to `next`. A stage may
    /// short-circuit by not calling `next`, call it exactly once, or
    /// call it and then inspect or replace the response.
    async fn handle(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Result<()>;
}

/// Continuation into the remainder of the pipeline.
///
/// Consumed by value, so a second call from the same stage is
/// unrepresentable. The context additionally tracks per-stage entry
/// and fails with `InvalidPipelineUsage` if a stage is ever re-entered
/// within one invocation (e.g. by re-invoking the pipeline from inside
/// a middleware).
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Handler,
    index: usize,
    total: usize,
}

impl Next<'_> {
    /// Run the remaining stages and the terminal handler.
    pub async fn run(self, ctx: &mut InvocationContext) -> Result<()> {
        ctx.enter_stage(self.index, self.total)?;
        match self.stages.get(self.index) {
            Some(middleware) => {
                let next = Next {
                    stages: self.stages,
                    terminal: self.terminal,
                    index: self.index + 1,
                    total: self.total,
                };
                middleware.handle(ctx, next).await
            }
            None => self.terminal.invoke(ctx).await,
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("total", &self.total)
            .finish()
    }
}

/// Immutable middleware chain around a terminal handler. Built once,
/// cheap to clone, safe to invoke repeatedly: it holds no mutable
/// state of its own.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Middleware>]>,
    terminal: Arc<dyn Handler>,
}

impl Pipeline {
    /// Compose `middlewares` around `terminal`. The first element of
    /// `middlewares` becomes the outermost stage.
    pub fn build(terminal: Arc<dyn Handler>, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            stages: middlewares.into(),
            terminal,
        }
    }

    /// Number of middleware stages (terminal handler excluded).
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Drive one invocation through the chain.
    pub async fn invoke(&self, ctx: &mut InvocationContext) -> Result<()> {
        let next = Next {
            stages: self.stages.as_ref(),
            terminal: self.terminal.as_ref(),
            index: 0,
            total: self.stages.len() + 1,
        };
        next.run(ctx).await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stage_count", &self.stages.len())
            .finish()
    }
}

/// Adapter turning a plain function into a [`Handler`].
pub struct FnHandler {
    f: Box<dyn for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, Result<()>> + Send + Sync>,
}

/// Wrap a borrowing async function as the terminal handler.
pub fn handler_fn<F>(f: F) -> FnHandler
where
    F: for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    FnHandler { f: Box::new(f) }
}

#[async_trait]
impl Handler for FnHandler {
    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<()> {
        (self.f)(ctx).await
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish()
    }
}

/// Terminal handler over typed request/response values: deserializes
/// the raw event through the injected codec, awaits the user function,
/// and stores the serialized response in the context slot.
pub struct TypedHandler<C, F, T, Fut, R> {
    codec: C,
    f: F,
    _marker: PhantomData<fn(T) -> (Fut, R)>,
}

/// Build a [`TypedHandler`] from a codec and an async function.
pub fn typed_handler<C, F, T, Fut, R>(codec: C, f: F) -> TypedHandler<C, F, T, Fut, R>
where
    C: Codec,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<R>> + Send,
    T: DeserializeOwned + Send + Sync,
    R: Serialize + Send + Sync,
{
    TypedHandler {
        codec,
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<C, F, T, Fut, R> Handler for TypedHandler<C, F, T, Fut, R>
where
    C: Codec,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<R>> + Send,
    T: DeserializeOwned + Send + Sync,
    R: Serialize + Send + Sync,
{
    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<()> {
        let event: T = self.codec.deserialize(ctx.raw_event())?;
        let response = (self.f)(event).await.map_err(RuntimeError::Handler)?;
        let body = self.codec.serialize(&response)?;
        ctx.set_response(body)
    }
}

impl<C, F, T, Fut, R> fmt::Debug for TypedHandler<C, F, T, Fut, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedHandler").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use nimbus_protocol::{Invocation, JsonCodec};
    use tokio_util::sync::CancellationToken;

    use crate::scope::{NoopScopeFactory, ScopeFactory};

    fn context(payload: &[u8]) -> InvocationContext {
        let invocation = Invocation {
            id: "inv-1".into(),
            deadline: Utc::now() + chrono::Duration::seconds(30),
            payload: payload.to_vec(),
            trace_id: None,
            function_arn: None,
        };
        InvocationContext::new(
            invocation,
            CancellationToken::new(),
            NoopScopeFactory.create_scope(),
        )
    }

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
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

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(&self, ctx: &mut InvocationContext, _next: Next<'_>) -> Result<()> {
            ctx.set_response(b"\"cached\"".to_vec())
        }
    }

    struct RecordingHandler {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn invoke(&self, ctx: &mut InvocationContext) -> Result<()> {
            self.log.lock().unwrap().push("handler".into());
            ctx.set_response(b"\"done\"".to_vec())
        }
    }

    #[tokio::test]
    async fn first_registered_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::build(
            Arc::new(RecordingHandler { log: Arc::clone(&log) }),
            vec![
                Arc::new(Recording { label: "a", log: Arc::clone(&log) }),
                Arc::new(Recording { label: "b", log: Arc::clone(&log) }),
            ],
        );
        let mut ctx = context(b"null");
        pipeline.invoke(&mut ctx).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a-before", "b-before", "handler", "b-after", "a-after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_stages_and_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::build(
            Arc::new(RecordingHandler { log: Arc::clone(&log) }),
            vec![
                Arc::new(ShortCircuit),
                Arc::new(Recording { label: "inner", log: Arc::clone(&log) }),
            ],
        );
        let mut ctx = context(b"null");
        pipeline.invoke(&mut ctx).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(ctx.take_response().unwrap(), b"\"cached\"");
    }

    #[tokio::test]
    async fn errors_propagate_through_outer_stages() {
        struct Failing;

        #[async_trait]
        impl Handler for Failing {
            async fn invoke(&self, _ctx: &mut InvocationContext) -> Result<()> {
                Err(RuntimeError::Handler(anyhow::anyhow!("boom")))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::build(
            Arc::new(Failing),
            vec![Arc::new(Recording { label: "outer", log: Arc::clone(&log) })],
        );
        let mut ctx = context(b"null");
        let result = pipeline.invoke(&mut ctx).await;
        assert!(matches!(result, Err(RuntimeError::Handler(_))));
        // The outer stage observed the error on the way up.
        assert_eq!(*log.lock().unwrap(), vec!["outer-before", "outer-after"]);
    }

    #[tokio::test]
    async fn re_entering_the_pipeline_within_one_invocation_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::build(Arc::new(RecordingHandler { log }), Vec::new());
        let mut ctx = context(b"null");
        pipeline.invoke(&mut ctx).await.unwrap();
        let second = pipeline.invoke(&mut ctx).await;
        assert!(matches!(second, Err(RuntimeError::InvalidPipelineUsage(0))));
    }

    fn echo<'a>(ctx: &'a mut InvocationContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = ctx.raw_event().to_vec();
            ctx.set_response(body)
        })
    }

    #[tokio::test]
    async fn handler_fn_adapts_plain_functions() {
        let pipeline = Pipeline::build(Arc::new(handler_fn(echo)), Vec::new());
        let mut ctx = context(br#""echo""#);
        pipeline.invoke(&mut ctx).await.unwrap();
        assert_eq!(ctx.take_response().unwrap(), br#""echo""#);
    }

    #[tokio::test]
    async fn typed_handler_deserializes_runs_and_serializes() {
        let handler = typed_handler(JsonCodec, |name: String| async move {
            Ok(format!("Hello {name}!"))
        });
        let pipeline = Pipeline::build(Arc::new(handler), Vec::new());
        let mut ctx = context(br#""world""#);
        pipeline.invoke(&mut ctx).await.unwrap();
        assert_eq!(ctx.take_response().unwrap(), br#""Hello world!""#);
    }

    #[tokio::test]
    async fn typed_handler_surfaces_codec_failures() {
        let handler = typed_handler(JsonCodec, |name: String| async move {
            Ok(format!("Hello {name}!"))
        });
        let pipeline = Pipeline::build(Arc::new(handler), Vec::new());
        let mut ctx = context(b"{not json");
        let result = pipeline.invoke(&mut ctx).await;
        assert!(matches!(result, Err(RuntimeError::Codec(_))));
    }
}
