//! # Nimbus Runtime
//!
//! Host runtime for short-lived, single-invocation serverless
//! functions.
//!
//! ## Overview
//!
//! The runtime repeatedly polls a control-plane API for work, executes
//! the registered handler through a composable middleware pipeline
//! under a deadline-derived cancellation token, and reports success or
//! a structured failure back to the control plane. Exactly one
//! invocation is in flight at a time; a failing invocation is reported
//! and the loop keeps serving.
//!
//! ## Architecture
//!
//! - [`deadline`]: derives a per-invocation cancellation token that
//!   fires a configurable buffer before the deadline.
//! - [`context`]: per-invocation state container with a set-once
//!   response slot and a scoped resolver handle released on every exit
//!   path.
//! - [`pipeline`]: build-once, immutable middleware composition around
//!   a terminal handler.
//! - [`lifecycle`]: sequential fail-fast init hooks, concurrent
//!   fail-soft shutdown hooks with error aggregation.
//! - [`client`]: thin HTTP client over the control-plane protocol.
//! - [`bootstrap`]: the poll/dispatch/report control loop.

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod context;
pub mod deadline;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod scope;
pub mod telemetry;

pub use bootstrap::{RuntimeHost, RuntimeHostBuilder};
pub use client::ControlPlaneClient;
pub use config::RuntimeConfig;
pub use context::InvocationContext;
pub use deadline::DeadlineTokenFactory;
pub use error::{Result, RuntimeError, ShutdownError};
pub use lifecycle::{
    InitFlow, InitHook, InitOutcome, LifecycleOrchestrator, LifecyclePhase, ShutdownHook,
};
pub use pipeline::{
    FnHandler, Handler, Middleware, Next, Pipeline, TypedHandler, handler_fn, typed_handler,
};
pub use scope::{NoopScopeFactory, ResolverScope, ScopeFactory};
