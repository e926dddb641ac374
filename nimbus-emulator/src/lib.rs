//! # Nimbus Emulator
//!
//! An in-process control plane for exercising nimbus functions in
//! tests. [`LocalRuntime`] binds the wire protocol on a loopback
//! socket, runs a real [`nimbus_runtime::RuntimeHost`] against it, and
//! exposes a request/response style [`LocalRuntime::invoke`] API with
//! FIFO completion correlation.
//!
//! The emulator speaks the exact same HTTP surface as a production
//! control plane, so everything from header parsing to error reporting
//! is exercised end to end.

pub mod core;
pub mod error;
pub mod local;
pub mod server;
pub mod state;

pub use crate::core::{Completion, DispatchCore};
pub use error::EmulatorError;
pub use local::{
    InvocationResult, InvokeOptions, LocalRuntime, LocalRuntimeBuilder,
};
pub use state::ServerState;
