//! Per-invocation cancellation tokens derived from absolute deadlines.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Produces cancellation tokens that fire a configurable buffer before
/// an absolute deadline, never after it.
///
/// A past (or inside-buffer) deadline yields an already-cancelled
/// token: cancellation is the correct observable outcome there, not an
/// error. Tokens are children of the supplied parent, so host-level
/// cancellation propagates immediately.
#[derive(Debug, Clone)]
pub struct DeadlineTokenFactory {
    buffer: Duration,
}

impl DeadlineTokenFactory {
    /// Factory with the given safety buffer.
    pub fn new(buffer: Duration) -> Self {
        Self { buffer }
    }

    /// Safety margin subtracted from every deadline.
    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    /// Derive a token that fires at `deadline - buffer`.
    ///
    /// Must be called from within a tokio runtime: the trigger is a
    /// spawned timer that cancels the token and exits early if the
    /// token is cancelled through the parent first.
    pub fn token(&self, deadline: DateTime<Utc>, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        if token.is_cancelled() {
            return token;
        }

        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let fire_in = remaining.saturating_sub(self.buffer);
        if fire_in.is_zero() {
            token.cancel();
            return token;
        }

        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(fire_in) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deadline_in(duration: chrono::Duration) -> DateTime<Utc> {
        Utc::now() + duration
    }

    #[tokio::test]
    async fn past_deadline_yields_a_cancelled_token() {
        let factory = DeadlineTokenFactory::new(Duration::ZERO);
        let parent = CancellationToken::new();
        let token = factory.token(deadline_in(chrono::Duration::seconds(-5)), &parent);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_inside_the_buffer_yields_a_cancelled_token() {
        let factory = DeadlineTokenFactory::new(Duration::from_secs(10));
        let parent = CancellationToken::new();
        let token = factory.token(deadline_in(chrono::Duration::seconds(2)), &parent);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn pre_cancelled_parent_short_circuits() {
        let factory = DeadlineTokenFactory::new(Duration::ZERO);
        let parent = CancellationToken::new();
        parent.cancel();
        let token = factory.token(deadline_in(chrono::Duration::hours(1)), &parent);
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn token_fires_buffer_before_the_deadline() {
        let factory = DeadlineTokenFactory::new(Duration::from_secs(1));
        let parent = CancellationToken::new();
        let token = factory.token(deadline_in(chrono::Duration::seconds(10)), &parent);
        assert!(!token.is_cancelled());

        let started = tokio::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(60), token.cancelled())
            .await
            .expect("token must fire before the deadline");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(8), "fired too early: {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(10), "fired too late: {elapsed:?}");
    }

    #[tokio::test]
    async fn parent_cancellation_propagates_immediately() {
        let factory = DeadlineTokenFactory::new(Duration::ZERO);
        let parent = CancellationToken::new();
        let token = factory.token(deadline_in(chrono::Duration::hours(1)), &parent);
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("parent cancellation must propagate");
    }
}
