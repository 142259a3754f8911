// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Drain and Shutdown
//!
//! The worker moves through `Running → Draining → Closed`, one way only.
//!
//! While draining, consumers keep working. The [`Drainer`] polls every known queue
//! and restarts the pass after [`DRAIN_POLL_INTERVAL`] as soon as one of them still
//! holds messages or a handler is still running. Only a full pass of zeros lets it
//! close the channels and then the connection.
//!
//! Broker-side counts are not pushed to us, hence the level-triggered polling. The
//! loop assumes producers already stopped: if messages keep arriving faster than
//! they are consumed it never finishes.

use crate::{consumer::InFlight, errors::AmqpError};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info};

/// Pause between two polling passes.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Running,
    Draining,
    Closed,
}

/// Watchable lifecycle state shared by the client, the dispatcher and the drainer.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<LifecycleState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Moves `Running → Draining`. Returns `false` when shutdown already started.
    pub fn begin_drain(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Draining;
                true
            } else {
                false
            }
        })
    }

    /// Moves to `Closed`.
    pub fn close(&self) {
        self.state.send_replace(LifecycleState::Closed);
    }

    /// Resolves once the state is `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == LifecycleState::Closed).await;
    }
}

/// Broker operations the drain needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DrainTarget: Send + Sync {
    /// Number of messages still waiting in `queue`.
    async fn pending_messages(&self, queue: &str) -> Result<u32, AmqpError>;

    async fn close_channels(&self) -> Result<(), AmqpError>;

    async fn close_connection(&self) -> Result<(), AmqpError>;
}

/// Errors raised by [`Drainer::shutdown`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("shutdown already requested")]
    AlreadyShuttingDown,

    #[error(transparent)]
    Amqp(#[from] AmqpError),
}

/// Waits for the known queues and running handlers to empty, then releases the
/// broker resources.
pub struct Drainer {
    target: Arc<dyn DrainTarget>,
    lifecycle: Lifecycle,
    queues: Vec<String>,
    in_flight: InFlight,
    poll_interval: Duration,
}

impl Drainer {
    /// Creates a drainer polling every [`DRAIN_POLL_INTERVAL`].
    ///
    /// # Parameters
    /// * `target` - Broker operations used for inspection and close
    /// * `lifecycle` - Lifecycle moved to `Draining` then `Closed`
    /// * `queues` - Queues polled, in order, on every pass
    /// * `in_flight` - Counter of handlers still running
    pub fn new(
        target: Arc<dyn DrainTarget>,
        lifecycle: Lifecycle,
        queues: Vec<String>,
        in_flight: InFlight,
    ) -> Self {
        Drainer {
            target,
            lifecycle,
            queues,
            in_flight,
            poll_interval: DRAIN_POLL_INTERVAL,
        }
    }

    /// Replaces the pause between two polling passes.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Drains every known queue, then closes channels and connection.
    ///
    /// Only the first call runs; later calls get [`DrainError::AlreadyShuttingDown`].
    /// A failing step aborts the sequence without retrying it.
    pub async fn shutdown(&self) -> Result<(), DrainError> {
        if !self.lifecycle.begin_drain() {
            return Err(DrainError::AlreadyShuttingDown);
        }

        info!(queues = ?self.queues, "draining queues");

        let result = self.drain_then_close().await;
        self.lifecycle.close();

        if let Err(err) = &result {
            error!(error = err.to_string(), "shutdown failed");
        }

        result.map_err(DrainError::from)
    }

    async fn drain_then_close(&self) -> Result<(), AmqpError> {
        self.wait_until_drained().await?;

        self.target.close_channels().await?;
        self.target.close_connection().await?;

        info!("broker resources released");
        Ok(())
    }

    async fn wait_until_drained(&self) -> Result<(), AmqpError> {
        loop {
            if self.pass_is_clean().await? {
                info!("there are no messages left in any queue");
                return Ok(());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One polling pass; `true` when every queue is empty and nothing is in flight.
    async fn pass_is_clean(&self) -> Result<bool, AmqpError> {
        for queue in &self.queues {
            let pending = self.target.pending_messages(queue).await?;
            info!(queue = %queue, pending, "messages left in queue");

            if pending > 0 {
                return Ok(false);
            }
        }

        let in_flight = self.in_flight.current();
        if in_flight > 0 {
            info!(in_flight, "waiting for running handlers");
            return Ok(false);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::{predicate::eq, Sequence};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn drainer(target: MockDrainTarget, queues: &[&str]) -> (Drainer, Lifecycle) {
        let lifecycle = Lifecycle::new();
        let drainer = Drainer::new(
            Arc::new(target),
            lifecycle.clone(),
            queues.iter().map(|q| q.to_string()).collect(),
            InFlight::default(),
        );
        (drainer, lifecycle)
    }

    fn closes_once(target: &mut MockDrainTarget) {
        let mut seq = Sequence::new();
        target
            .expect_close_channels()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        target
            .expect_close_connection()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.current(), LifecycleState::Running);

        assert!(lifecycle.begin_drain());
        assert_eq!(lifecycle.current(), LifecycleState::Draining);
        assert!(!lifecycle.begin_drain());

        lifecycle.close();
        assert_eq!(lifecycle.current(), LifecycleState::Closed);
        assert!(!lifecycle.begin_drain());
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let lifecycle = Lifecycle::new();
        let waiter = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.closed().await }
        });

        assert!(lifecycle.begin_drain());
        lifecycle.close();

        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queues_drain_within_one_interval() {
        let mut target = MockDrainTarget::new();
        target
            .expect_pending_messages()
            .times(2)
            .returning(|_| Ok(0));
        closes_once(&mut target);

        let (drainer, lifecycle) = drainer(target, &["MAIL", "SMS"]);
        let started = tokio::time::Instant::now();

        drainer.shutdown().await.unwrap();

        assert!(started.elapsed() < DRAIN_POLL_INTERVAL);
        assert_eq!(lifecycle.current(), LifecycleState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_full_clean_pass() {
        // `orders` holds 5 messages that get consumed over five polls.
        let remaining = Arc::new(AtomicU32::new(5));
        let polled = remaining.clone();

        let mut target = MockDrainTarget::new();
        target
            .expect_pending_messages()
            .with(eq("orders"))
            .returning(move |_| {
                let left = polled.load(Ordering::SeqCst);
                if left > 0 {
                    polled.store(left - 1, Ordering::SeqCst);
                }
                Ok(left)
            });
        target
            .expect_pending_messages()
            .with(eq("audit"))
            .returning(|_| Ok(0));
        closes_once(&mut target);

        let (drainer, lifecycle) = drainer(target, &["orders", "audit"]);
        let started = tokio::time::Instant::now();

        drainer.shutdown().await.unwrap();

        assert_eq!(remaining.load(Ordering::SeqCst), 0);
        assert_eq!(started.elapsed(), DRAIN_POLL_INTERVAL * 5);
        assert_eq!(lifecycle.current(), LifecycleState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_pass_from_first_queue() {
        let mut seq = Sequence::new();
        let mut target = MockDrainTarget::new();

        // first pass: `a` empty, `b` busy -> sleep and start over from `a`
        target
            .expect_pending_messages()
            .with(eq("a"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(0));
        target
            .expect_pending_messages()
            .with(eq("b"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(3));
        target
            .expect_pending_messages()
            .with(eq("a"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(0));
        target
            .expect_pending_messages()
            .with(eq("b"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(0));
        closes_once(&mut target);

        let (drainer, _) = drainer(target, &["a", "b"]);
        drainer.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_in_flight_handlers() {
        let mut target = MockDrainTarget::new();
        target.expect_pending_messages().returning(|_| Ok(0));
        closes_once(&mut target);

        let in_flight = InFlight::default();
        let guard = in_flight.enter();

        let drainer = Drainer::new(
            Arc::new(target),
            Lifecycle::new(),
            vec!["MAIL".to_owned()],
            in_flight.clone(),
        );

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            drop(guard);
        });

        let started = tokio::time::Instant::now();
        drainer.shutdown().await.unwrap();
        release.await.unwrap();

        assert_eq!(started.elapsed(), DRAIN_POLL_INTERVAL * 3);
        assert_eq!(in_flight.current(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_poll_interval_paces_the_passes() {
        let polls = Arc::new(AtomicU32::new(0));
        let counted = polls.clone();

        let mut target = MockDrainTarget::new();
        target.expect_pending_messages().returning(move |_| {
            // busy for the first two passes
            Ok(u32::from(counted.fetch_add(1, Ordering::SeqCst) < 2))
        });
        closes_once(&mut target);

        let (drainer, _) = drainer(target, &["MAIL"]);
        let drainer = drainer.with_poll_interval(Duration::from_millis(250));
        let started = tokio::time::Instant::now();

        drainer.shutdown().await.unwrap();

        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn second_shutdown_is_rejected() {
        let mut target = MockDrainTarget::new();
        target.expect_pending_messages().returning(|_| Ok(0));
        closes_once(&mut target);

        let (drainer, _) = drainer(target, &["MAIL"]);

        drainer.shutdown().await.unwrap();
        assert_eq!(
            drainer.shutdown().await,
            Err(DrainError::AlreadyShuttingDown)
        );
    }

    #[tokio::test]
    async fn inspection_failure_aborts_without_closing() {
        let mut target = MockDrainTarget::new();
        target
            .expect_pending_messages()
            .returning(|q| Err(AmqpError::InspectQueueError(q.to_owned())));
        target.expect_close_channels().never();
        target.expect_close_connection().never();

        let (drainer, lifecycle) = drainer(target, &["MAIL"]);

        assert_eq!(
            drainer.shutdown().await,
            Err(DrainError::Amqp(AmqpError::InspectQueueError("MAIL".into())))
        );
        assert_eq!(lifecycle.current(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn channel_close_failure_skips_connection_close() {
        let mut target = MockDrainTarget::new();
        target.expect_pending_messages().returning(|_| Ok(0));
        target
            .expect_close_channels()
            .times(1)
            .returning(|| Err(AmqpError::CloseError("1 of 2 channels".into())));
        target.expect_close_connection().never();

        let (drainer, _) = drainer(target, &["MAIL"]);

        assert!(matches!(
            drainer.shutdown().await,
            Err(DrainError::Amqp(AmqpError::CloseError(_)))
        ));
    }
}
