//! Dispatch bookkeeping shared between the wire server and the local
//! invoke API.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use nimbus_protocol::{ErrorReport, Invocation};

use crate::error::EmulatorError;

/// Outcome of a dispatched invocation, as reported by the runtime.
#[derive(Debug, Clone)]
pub enum Completion {
    /// The runtime posted a successful response body.
    Response(Vec<u8>),
    /// The runtime posted a structured error report.
    Error(ErrorReport),
}

/// FIFO invocation queue plus the completion correlation table.
///
/// Submission order is the delivery order: the pending entry and the
/// queue send happen under one lock, so two concurrent `submit` calls
/// can never be observed by the poller in the opposite order.
#[derive(Debug)]
pub struct DispatchCore {
    queue_tx: mpsc::UnboundedSender<Invocation>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Invocation>>,
    pending: Mutex<Pending>,
    polled: AtomicBool,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct Pending {
    waiters: HashMap<String, oneshot::Sender<Completion>>,
    init_error: Option<ErrorReport>,
}

impl DispatchCore {
    /// New, empty core.
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            pending: Mutex::new(Pending::default()),
            polled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an invocation and hand back the channel its completion
    /// will arrive on.
    pub fn submit(
        &self,
        invocation: Invocation,
    ) -> Result<oneshot::Receiver<Completion>, EmulatorError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        if self.closed.load(Ordering::SeqCst) {
            return Err(EmulatorError::ChannelClosed);
        }
        pending.waiters.insert(invocation.id.clone(), tx);
        debug!(invocation_id = %invocation.id, "invocation queued");
        self.queue_tx
            .send(invocation)
            .map_err(|_| EmulatorError::ChannelClosed)?;
        Ok(rx)
    }

    /// Wait for the next queued invocation. Returns `None` once the
    /// queue is closed and drained.
    pub async fn next(&self) -> Option<Invocation> {
        self.polled.store(true, Ordering::SeqCst);
        let mut rx = self.queue_rx.lock().await;
        rx.recv().await
    }

    /// Correlate a completion back to its waiting submitter.
    ///
    /// The first completion for an id consumes the waiter; a second one
    /// is an unknown-invocation error.
    pub fn complete(&self, id: &str, completion: Completion) -> Result<(), EmulatorError> {
        let waiter = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.waiters.remove(id)
        };
        let Some(waiter) = waiter else {
            return Err(EmulatorError::UnknownInvocation(id.to_owned()));
        };
        // A submitter that gave up waiting is not an error.
        let _ = waiter.send(completion);
        Ok(())
    }

    /// Record an init-phase failure. Only legal before the runtime has
    /// polled for work.
    pub fn record_init_error(&self, report: ErrorReport) -> Result<(), EmulatorError> {
        if self.polled.load(Ordering::SeqCst) {
            return Err(EmulatorError::InvalidState(
                "init error reported after the first invocation poll".into(),
            ));
        }
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.init_error = Some(report);
        Ok(())
    }

    /// The init error reported by the runtime, if any.
    pub fn reported_init_error(&self) -> Option<ErrorReport> {
        let pending = self.pending.lock().expect("pending lock poisoned");
        pending.init_error.clone()
    }

    /// Reject further submissions and fail every waiter still pending.
    ///
    /// Dropping the waiting oneshot senders resolves the submitters'
    /// receivers with a channel error, so no `invoke` caller is left
    /// hanging on work the stopped host will never poll. Setting the
    /// flag and draining happen under the pending lock, so a racing
    /// `submit` either lands before the drain (and is failed by it) or
    /// observes the closed flag.
    pub fn close(&self) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        self.closed.store(true, Ordering::SeqCst);
        let abandoned = pending.waiters.len();
        if abandoned > 0 {
            debug!(abandoned, "failing waiters still pending at close");
        }
        pending.waiters.clear();
    }

    /// Number of invocations still waiting for a completion.
    pub fn in_flight(&self) -> usize {
        let pending = self.pending.lock().expect("pending lock poisoned");
        pending.waiters.len()
    }
}

impl Default for DispatchCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn invocation(id: &str) -> Invocation {
        Invocation {
            id: id.to_owned(),
            deadline: Utc::now() + Duration::seconds(30),
            payload: b"{}".to_vec(),
            trace_id: None,
            function_arn: None,
        }
    }

    #[tokio::test]
    async fn delivery_preserves_submission_order() {
        let core = DispatchCore::new();
        let mut receivers = Vec::new();
        for n in 0..10 {
            receivers.push(core.submit(invocation(&format!("inv-{n}"))).unwrap());
        }
        for n in 0..10 {
            let polled = core.next().await.unwrap();
            assert_eq!(polled.id, format!("inv-{n}"));
        }
        drop(receivers);
    }

    #[tokio::test]
    async fn completion_reaches_the_submitter() {
        let core = DispatchCore::new();
        let rx = core.submit(invocation("inv-1")).unwrap();
        core.next().await.unwrap();
        core.complete("inv-1", Completion::Response(b"ok".to_vec()))
            .unwrap();
        match rx.await.unwrap() {
            Completion::Response(body) => assert_eq!(body, b"ok"),
            Completion::Error(report) => panic!("unexpected error: {report:?}"),
        }
    }

    #[tokio::test]
    async fn double_completion_is_rejected() {
        let core = DispatchCore::new();
        let _rx = core.submit(invocation("inv-1")).unwrap();
        core.complete("inv-1", Completion::Response(Vec::new()))
            .unwrap();
        let err = core
            .complete("inv-1", Completion::Response(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, EmulatorError::UnknownInvocation(_)));
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let core = DispatchCore::new();
        let err = core
            .complete("never-dispatched", Completion::Response(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, EmulatorError::UnknownInvocation(_)));
    }

    #[tokio::test]
    async fn close_fails_pending_waiters_and_rejects_new_submissions() {
        let core = DispatchCore::new();
        let rx = core.submit(invocation("inv-1")).unwrap();
        core.close();
        assert!(rx.await.is_err(), "abandoned waiter must resolve with an error");
        let err = core.submit(invocation("inv-2")).unwrap_err();
        assert!(matches!(err, EmulatorError::ChannelClosed));
    }

    #[tokio::test]
    async fn init_error_rejected_after_first_poll() {
        let core = DispatchCore::new();
        let _rx = core.submit(invocation("inv-1")).unwrap();
        core.next().await.unwrap();
        let report = ErrorReport::new("Nimbus.InitError", "boom");
        let err = core.record_init_error(report).unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidState(_)));
    }

    #[tokio::test]
    async fn init_error_recorded_before_poll() {
        let core = DispatchCore::new();
        core.record_init_error(ErrorReport::new("Nimbus.InitError", "boom"))
            .unwrap();
        let report = core.reported_init_error().unwrap();
        assert_eq!(report.error_type, "Nimbus.InitError");
    }
}
