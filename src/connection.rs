// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Management
//!
//! [`BrokerClient`] owns the single AMQP connection of the process. It is built once
//! at startup and shared by reference with the publisher, the dispatcher and the
//! drain controller.
//!
//! When the connection drops without the client asking for it, lapin reports the
//! error to a supervisor task which waits [`RECONNECT_DELAY`] and connects again,
//! for as long as the process runs. Channels belong to the connection that created
//! them: after a reconnect the connection generation is bumped and consumer
//! bindings open fresh channels.

use crate::{
    configs::Configs,
    drain::{DrainTarget, Lifecycle},
    errors::{is_expected_error, AmqpError},
    topology,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Fixed pause before every reconnect attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

const CLOSE_REPLY_CODE: u16 = 200;
const CLOSE_REPLY_TEXT: &str = "worker shutdown";

/// Shared handle on the broker connection.
///
/// Holds the current connection, a control channel used for queue inspection and
/// the long-lived channels of consumer bindings, which shutdown closes together.
pub struct BrokerClient {
    url: String,
    connection_name: String,
    connection: RwLock<Option<Arc<Connection>>>,
    control: RwLock<Option<Arc<Channel>>>,
    channels: Mutex<Vec<Arc<Channel>>>,
    generation: watch::Sender<u64>,
    lifecycle: Lifecycle,
    closing: AtomicBool,
    lost: mpsc::UnboundedSender<lapin::Error>,
}

impl BrokerClient {
    /// Connects to the broker and starts the reconnect supervisor.
    ///
    /// Errors classified as expected close races are logged and swallowed; the
    /// supervisor then keeps trying in the background. Any other error is returned
    /// and is meant to abort startup.
    ///
    /// # Parameters
    /// * `cfg` - Configuration carrying the broker URL and the application name,
    ///   used as connection name
    ///
    /// # Returns
    /// The shared client, possibly not connected yet, or the fatal `AmqpError`
    pub async fn connect(cfg: &Configs) -> Result<Arc<BrokerClient>, AmqpError> {
        let (client, lost_rx) = BrokerClient::disconnected(cfg);

        match client.establish().await {
            Ok(()) => {}
            Err(ConnectFailure::Expected(err)) => {
                warn!(error = err.to_string(), "expected error while connecting");
                let _ = client.lost.send(err);
            }
            Err(ConnectFailure::Fatal(err)) => return Err(err),
        }

        tokio::spawn(supervise(Arc::downgrade(&client), lost_rx));

        Ok(client)
    }

    /// Builds a client without any connection yet, plus the receiver of connection losses.
    pub(crate) fn disconnected(
        cfg: &Configs,
    ) -> (Arc<BrokerClient>, mpsc::UnboundedReceiver<lapin::Error>) {
        let (lost, lost_rx) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0);

        let client = Arc::new(BrokerClient {
            url: cfg.rabbitmq.url.clone(),
            connection_name: cfg.app.name.clone(),
            connection: RwLock::new(None),
            control: RwLock::new(None),
            channels: Mutex::new(vec![]),
            generation,
            lifecycle: Lifecycle::new(),
            closing: AtomicBool::new(false),
            lost,
        });

        (client, lost_rx)
    }

    /// Opens one connection plus its control channel and publishes them.
    async fn establish(&self) -> Result<(), ConnectFailure> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.url, options).await {
            Ok(conn) => conn,
            Err(err) if is_expected_error(&err) => return Err(ConnectFailure::Expected(err)),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(ConnectFailure::Fatal(AmqpError::ConnectionError(
                    err.to_string(),
                )));
            }
        };

        let lost = self.lost.clone();
        conn.on_error(move |err| {
            let _ = lost.send(err);
        });

        let control = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the control channel");
                if let Err(err) = conn
                    .close(CLOSE_REPLY_CODE, "control channel failure")
                    .await
                {
                    debug!(error = err.to_string(), "closing half-open connection");
                }
                return Err(ConnectFailure::Fatal(AmqpError::ChannelError));
            }
        };

        *write(&self.connection) = Some(Arc::new(conn));
        *write(&self.control) = Some(Arc::new(control));
        self.generation.send_modify(|generation| *generation += 1);

        info!("amqp connected");
        Ok(())
    }

    /// Lifecycle shared by every component built on this client.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Receiver that changes every time a new connection is established.
    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Resolves once a connection has been established at least once.
    pub async fn first_connection(&self) {
        let mut generation = self.generation.subscribe();
        let _ = generation.wait_for(|generation| *generation > 0).await;
    }

    pub fn is_connected(&self) -> bool {
        read(&self.connection)
            .as_ref()
            .is_some_and(|conn| conn.status().connected())
    }

    /// Opens a channel on the current connection.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        let conn = read(&self.connection)
            .clone()
            .ok_or(AmqpError::NotConnected)?;

        conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError
        })
    }

    /// Keeps `channel` for shutdown, dropping entries whose connection is gone.
    pub fn register_channel(&self, channel: Arc<Channel>) {
        let mut channels = lock(&self.channels);
        channels.retain(|ch| ch.status().connected());
        channels.push(channel);
    }

    /// Number of ready messages in `queue`.
    ///
    /// Declares the queue on the control channel, so inspecting a queue that does
    /// not exist yet creates it empty.
    ///
    /// # Returns
    /// The broker's message count, `NotConnected` without a connection, or
    /// `InspectQueueError` when the declaration fails
    pub async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        let control = read(&self.control).clone().ok_or(AmqpError::NotConnected)?;

        match topology::declare_queue(&control, queue).await {
            Ok(q) => Ok(q.message_count()),
            Err(_) => Err(AmqpError::InspectQueueError(queue.to_owned())),
        }
    }

    /// Closes every registered channel concurrently and waits for all of them.
    ///
    /// From here on the client is closing: bindings stop re-binding and lost
    /// connections are not re-established.
    pub async fn close_channels(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::SeqCst);
        let channels: Vec<Arc<Channel>> = lock(&self.channels).drain(..).collect();
        let total = channels.len();

        let results = join_all(
            channels
                .iter()
                .map(|channel| channel.close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT)),
        )
        .await;

        let mut failed = 0;
        for result in results {
            match result {
                Ok(()) => {}
                Err(err) if is_expected_error(&err) => {
                    debug!(error = err.to_string(), "channel already closing");
                }
                Err(err) => {
                    error!(error = err.to_string(), "error closing channel");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(AmqpError::CloseError(format!("{failed} of {total} channels")));
        }

        info!(channels = total, "channels closed");
        Ok(())
    }

    /// Closes the connection. The reconnect supervisor stops afterwards.
    pub async fn close_connection(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::SeqCst);

        let control = write(&self.control).take();
        if let Some(control) = control {
            if let Err(err) = control.close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT).await {
                debug!(error = err.to_string(), "control channel close");
            }
        }

        let conn = write(&self.connection).take();
        let Some(conn) = conn else {
            return Ok(());
        };

        match conn.close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT).await {
            Ok(()) => {
                info!("connection closed");
                Ok(())
            }
            Err(err) if is_expected_error(&err) => {
                debug!(error = err.to_string(), "connection already closing");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error closing connection");
                Err(AmqpError::CloseError("connection".to_owned()))
            }
        }
    }

    /// `true` once shutdown started releasing broker resources.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DrainTarget for BrokerClient {
    async fn pending_messages(&self, queue: &str) -> Result<u32, AmqpError> {
        self.message_count(queue).await
    }

    async fn close_channels(&self) -> Result<(), AmqpError> {
        BrokerClient::close_channels(self).await
    }

    async fn close_connection(&self) -> Result<(), AmqpError> {
        BrokerClient::close_connection(self).await
    }
}

enum ConnectFailure {
    Expected(lapin::Error),
    Fatal(AmqpError),
}

/// Reconnects after every unexpected connection loss until the client closes.
async fn supervise(
    client: std::sync::Weak<BrokerClient>,
    mut lost: mpsc::UnboundedReceiver<lapin::Error>,
) {
    while let Some(err) = lost.recv().await {
        let Some(client) = client.upgrade() else {
            return;
        };

        if client.is_closing() {
            debug!(error = err.to_string(), "connection error during shutdown");
            continue;
        }

        // Errors reported by channels of a connection that was already replaced.
        if client.is_connected() {
            debug!(error = err.to_string(), "stale connection error");
            continue;
        }

        warn!(error = err.to_string(), "connection lost");

        if !reconnect(|| client.establish(), || client.is_closing()).await {
            return;
        }
    }
}

/// Calls `attempt` every [`RECONNECT_DELAY`] until it succeeds or `closing` turns true.
///
/// There is no attempt limit and the delay never grows. Returns `false` when it gave
/// up because the client is closing.
async fn reconnect<F, Fut, C>(mut attempt: F, closing: C) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ConnectFailure>>,
    C: Fn() -> bool,
{
    loop {
        info!(delay = ?RECONNECT_DELAY, "reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;

        if closing() {
            return false;
        }

        match attempt().await {
            Ok(()) => return true,
            Err(ConnectFailure::Expected(err)) => {
                warn!(error = err.to_string(), "expected error while reconnecting")
            }
            Err(ConnectFailure::Fatal(err)) => {
                error!(error = err.to_string(), "reconnect failed")
            }
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::Configs;
    use lapin::ConnectionState;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    fn configs() -> Configs {
        Configs::from_lookup(|key| match key {
            "RABBITMQ_URL" => Some("amqp://localhost:1/%2f".to_owned()),
            "CONSUMER_PREFETCH" => Some("1".to_owned()),
            "CONSUMER_MAX_RETRY_COUNT" => Some("1".to_owned()),
            "CONSUMER_DELAY_MINUTES" => Some("1".to_owned()),
            _ => None,
        })
        .unwrap()
    }

    fn connection_closed() -> lapin::Error {
        lapin::Error::InvalidConnectionState(ConnectionState::Closed)
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_are_spaced_by_fixed_delay() {
        let started = Instant::now();
        let attempts = Mutex::new(vec![]);

        let reconnected = reconnect(
            || {
                let mut attempts = attempts.lock().unwrap();
                attempts.push(started.elapsed());
                let failed = attempts.len() < 4;
                async move {
                    if failed {
                        Err(ConnectFailure::Expected(connection_closed()))
                    } else {
                        Ok(())
                    }
                }
            },
            || false,
        )
        .await;

        assert!(reconnected);
        assert_eq!(
            *attempts.lock().unwrap(),
            vec![
                RECONNECT_DELAY,
                RECONNECT_DELAY * 2,
                RECONNECT_DELAY * 3,
                RECONNECT_DELAY * 4,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_keeps_trying_after_fatal_errors() {
        let attempts = AtomicUsize::new(0);

        let reconnected = reconnect(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 20 {
                        Err(ConnectFailure::Fatal(AmqpError::ConnectionError(
                            "refused".into(),
                        )))
                    } else {
                        Ok(())
                    }
                }
            },
            || false,
        )
        .await;

        assert!(reconnected);
        assert_eq!(attempts.load(Ordering::SeqCst), 21);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_stops_once_closing() {
        let started = Instant::now();
        let attempts = AtomicUsize::new(0);
        let closing = AtomicBool::new(false);

        let reconnected = reconnect(
            || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 1 {
                    closing.store(true, Ordering::SeqCst);
                }
                async { Err(ConnectFailure::Expected(connection_closed())) }
            },
            || closing.load(Ordering::SeqCst),
        )
        .await;

        assert!(!reconnected);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), RECONNECT_DELAY * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn losses_during_shutdown_are_not_reconnected() {
        let (client, lost_rx) = BrokerClient::disconnected(&configs());
        let supervisor = tokio::spawn(supervise(Arc::downgrade(&client), lost_rx));

        client.close_connection().await.unwrap();
        assert!(client.is_closing());

        client.lost.send(connection_closed()).unwrap();
        tokio::time::sleep(RECONNECT_DELAY * 3).await;

        // still waiting for the next loss instead of reconnecting
        assert!(!supervisor.is_finished());
        assert_eq!(*client.subscribe_generation().borrow(), 0);

        drop(client);
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_client_refuses_broker_operations() {
        let (client, _lost) = BrokerClient::disconnected(&configs());

        assert!(!client.is_connected());
        assert!(matches!(
            client.create_channel().await,
            Err(AmqpError::NotConnected)
        ));
        assert_eq!(
            client.message_count("MAIL").await,
            Err(AmqpError::NotConnected)
        );
        assert_eq!(client.close_channels().await, Ok(()));
        assert!(client.is_closing());
    }
}
