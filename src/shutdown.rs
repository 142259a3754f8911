// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Graceful Shutdown
//!
//! Runs once a termination signal arrived: stops inbound resources, drains the
//! broker, then closes what must outlive the drain. The first failing step aborts
//! the sequence.

use crate::drain::{DrainError, Drainer};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Process exit code after a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Process exit code after a failed startup or shutdown step.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    #[error(transparent)]
    Drain(#[from] DrainError),

    #[error("failure to close {name}: {reason}")]
    Resource { name: String, reason: String },
}

impl ShutdownError {
    pub fn resource(name: &str, reason: impl Into<String>) -> Self {
        ShutdownError::Resource {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Something the process must close during shutdown, such as an inbound server or a
/// database pool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalResource: Send + Sync {
    fn name(&self) -> String;

    async fn close(&self) -> Result<(), ShutdownError>;
}

/// Termination signal listeners.
///
/// Register them at startup, then wait with [`OsSignals::recv`] once the worker runs.
#[cfg(unix)]
pub struct OsSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl OsSignals {
    /// Registers the `SIGINT` and `SIGTERM` listeners.
    ///
    /// # Returns
    /// The listeners, or the `io::Error` raised by the registration
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(OsSignals {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the first of `SIGINT` or `SIGTERM`.
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => info!("SIGINT received"),
            _ = self.sigterm.recv() => info!("SIGTERM received"),
        }
    }
}

#[cfg(not(unix))]
pub struct OsSignals;

#[cfg(not(unix))]
impl OsSignals {
    pub fn register() -> std::io::Result<Self> {
        Ok(OsSignals)
    }

    pub async fn recv(&mut self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received"),
            Err(err) => error!(error = err.to_string(), "ctrl-c listener failed"),
        }
    }
}

/// Waits for `SIGINT` or `SIGTERM`, registering the listeners on the spot.
pub async fn wait_for_os_signal() -> std::io::Result<()> {
    OsSignals::register()?.recv().await;
    Ok(())
}

/// Ordered shutdown sequence of the process.
///
/// Resources registered with [`GracefulShutdown::stop_first`] are closed before the
/// broker drain, those registered with [`GracefulShutdown::close_after`] once the
/// broker connection is gone.
pub struct GracefulShutdown {
    drainer: Drainer,
    stop_first: Vec<Arc<dyn ExternalResource>>,
    close_after: Vec<Arc<dyn ExternalResource>>,
}

impl GracefulShutdown {
    pub fn new(drainer: Drainer) -> Self {
        GracefulShutdown {
            drainer,
            stop_first: vec![],
            close_after: vec![],
        }
    }

    /// Registers a resource stopped before the drain starts.
    pub fn stop_first(mut self, resource: Arc<dyn ExternalResource>) -> Self {
        self.stop_first.push(resource);
        self
    }

    /// Registers a resource closed once the broker is released.
    pub fn close_after(mut self, resource: Arc<dyn ExternalResource>) -> Self {
        self.close_after.push(resource);
        self
    }

    /// Runs every step in order and stops at the first failure.
    ///
    /// # Returns
    /// Ok(()) when every step succeeded, or the first `ShutdownError` raised
    pub async fn run(&self) -> Result<(), ShutdownError> {
        info!("graceful shutdown started");

        close_all(&self.stop_first).await?;
        self.drainer.shutdown().await?;
        close_all(&self.close_after).await?;

        info!("graceful shutdown finished");
        Ok(())
    }

    /// Runs the shutdown and maps its result to a process exit code.
    pub async fn run_to_exit_code(&self) -> i32 {
        match self.run().await {
            Ok(()) => EXIT_OK,
            Err(err) => {
                error!(error = err.to_string(), "graceful shutdown failed");
                EXIT_FAILURE
            }
        }
    }
}

async fn close_all(resources: &[Arc<dyn ExternalResource>]) -> Result<(), ShutdownError> {
    for resource in resources {
        let name = resource.name();
        resource.close().await?;
        info!(resource = %name, "resource closed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::InFlight,
        drain::{Lifecycle, LifecycleState, MockDrainTarget},
        errors::AmqpError,
    };
    use mockall::Sequence;
    use std::time::Duration;

    fn resource(
        name: &'static str,
        seq: &mut Sequence,
        result: Result<(), ShutdownError>,
    ) -> Arc<dyn ExternalResource> {
        let mut mock = MockExternalResource::new();
        mock.expect_name().return_const(name.to_owned());
        mock.expect_close()
            .times(1)
            .in_sequence(seq)
            .return_once(move || result);
        Arc::new(mock)
    }

    fn untouched(name: &'static str) -> Arc<dyn ExternalResource> {
        let mut mock = MockExternalResource::new();
        mock.expect_name().return_const(name.to_owned());
        mock.expect_close().never();
        Arc::new(mock)
    }

    fn drainer(target: MockDrainTarget) -> (Drainer, Lifecycle) {
        let lifecycle = Lifecycle::new();
        let drainer = Drainer::new(
            Arc::new(target),
            lifecycle.clone(),
            vec!["MAIL".to_owned()],
            InFlight::default(),
        );
        (drainer, lifecycle)
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let mut seq = Sequence::new();
        let server = resource("http", &mut seq, Ok(()));

        let mut target = MockDrainTarget::new();
        target
            .expect_pending_messages()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(0));
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

        let database = resource("database", &mut seq, Ok(()));

        let (drainer, lifecycle) = drainer(target);
        let shutdown = GracefulShutdown::new(drainer)
            .stop_first(server)
            .close_after(database);

        assert_eq!(shutdown.run_to_exit_code().await, EXIT_OK);
        assert_eq!(lifecycle.current(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn failing_stop_aborts_before_drain() {
        let mut seq = Sequence::new();
        let server = resource("http", &mut seq, Err(ShutdownError::resource("http", "busy")));

        let mut target = MockDrainTarget::new();
        target.expect_pending_messages().never();
        target.expect_close_channels().never();
        target.expect_close_connection().never();

        let (drainer, lifecycle) = drainer(target);
        let shutdown = GracefulShutdown::new(drainer)
            .stop_first(server)
            .close_after(untouched("database"));

        assert_eq!(
            shutdown.run().await,
            Err(ShutdownError::resource("http", "busy"))
        );
        assert_eq!(lifecycle.current(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn failing_drain_skips_remaining_resources() {
        let mut target = MockDrainTarget::new();
        target
            .expect_pending_messages()
            .returning(|queue| Err(AmqpError::InspectQueueError(queue.to_owned())));

        let (drainer, _) = drainer(target);
        let shutdown = GracefulShutdown::new(drainer).close_after(untouched("database"));

        assert_eq!(shutdown.run_to_exit_code().await, EXIT_FAILURE);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_wait_blocks_until_a_signal_arrives() {
        let mut first = OsSignals::register().unwrap();
        let mut second = OsSignals::register().unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(5), first.recv())
            .await
            .is_err());
        assert!(tokio::time::timeout(Duration::from_secs(5), second.recv())
            .await
            .is_err());
        assert!(
            tokio::time::timeout(Duration::from_secs(5), wait_for_os_signal())
                .await
                .is_err()
        );
    }

    #[test]
    fn resource_error_names_the_resource() {
        let err = ShutdownError::resource("database", "timeout");
        assert_eq!(err.to_string(), "failure to close database: timeout");
    }
}
