// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Binds handlers to work queues. Each binding owns a long-lived channel with its
//! own prefetch limit, registered with the [`BrokerClient`] so shutdown can close
//! it, and runs on its own task.
//!
//! A binding whose delivery stream ends (its channel or connection went away)
//! opens a new channel once the client is connected again, unless shutdown already
//! started releasing broker resources.

use crate::{
    configs::ConsumerConfigs,
    connection::{BrokerClient, RECONNECT_DELAY},
    consumer::{run_deliveries, BindingContext, InFlight, InboundMessage},
    drain::LifecycleState,
    errors::AmqpError,
    handler::{ConsumerHandler, HandlerRegistry},
    publisher::Publisher,
    queue::QueueDefinition,
    retry::RetryPolicy,
    topology,
};
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Consumer,
};
use futures_util::Stream;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Binds [`ConsumerHandler`]s to work queues, at most one binding per queue.
///
/// Every handler of the dispatcher shares the retry policy, the prefetch limit and
/// the in-flight counter built from the consumer configuration.
pub struct RabbitMQDispatcher {
    client: Arc<BrokerClient>,
    publisher: Arc<dyn Publisher>,
    policy: RetryPolicy,
    prefetch: u16,
    in_flight: InFlight,
    bindings: Mutex<HashMap<String, Option<JoinHandle<()>>>>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher with no binding yet.
    ///
    /// # Parameters
    /// * `client` - Broker client bindings open their channels on
    /// * `publisher` - Publisher used to redirect failed messages
    /// * `cfg` - Prefetch and retry settings applied to every binding
    pub fn new(
        client: Arc<BrokerClient>,
        publisher: Arc<dyn Publisher>,
        cfg: &ConsumerConfigs,
    ) -> Self {
        RabbitMQDispatcher {
            client,
            publisher,
            policy: RetryPolicy::from(cfg),
            prefetch: cfg.prefetch,
            in_flight: InFlight::default(),
            bindings: Mutex::new(HashMap::default()),
        }
    }

    /// Counter of messages currently held by handlers of this dispatcher.
    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    /// Starts consuming `queue` with `handler`.
    ///
    /// Fails when shutdown started, when `queue` is already bound, or when the
    /// initial channel, qos, declaration or consumer setup fails.
    ///
    /// # Parameters
    /// * `queue` - Work queue to consume from
    /// * `handler` - Handler run for every message of `queue`
    ///
    /// # Returns
    /// Ok(()) once the consumer is running, otherwise the `AmqpError` of the failed
    /// step
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        if self.client.lifecycle().current() != LifecycleState::Running {
            return Err(AmqpError::ShuttingDown);
        }

        {
            let mut bindings = lock(&self.bindings);
            if bindings.contains_key(queue) {
                return Err(AmqpError::AlreadyBound(queue.to_owned()));
            }
            bindings.insert(queue.to_owned(), None);
        }

        let ctx = Arc::new(BindingContext {
            queue: QueueDefinition::new(queue),
            handler,
            publisher: self.publisher.clone(),
            policy: self.policy,
            prefetch: self.prefetch,
            in_flight: self.in_flight.clone(),
        });

        let consumer = match open_binding(&self.client, &ctx).await {
            Ok(consumer) => consumer,
            Err(err) => {
                lock(&self.bindings).remove(queue);
                return Err(err);
            }
        };

        let client = self.client.clone();
        let reopen = {
            let client = client.clone();
            let ctx = ctx.clone();
            move || {
                let client = client.clone();
                let ctx = ctx.clone();
                async move { open_binding(&client, &ctx).await }
            }
        };
        let handle = tokio::spawn(supervise_binding(client, ctx, consumer, reopen));
        lock(&self.bindings).insert(queue.to_owned(), Some(handle));

        Ok(())
    }

    /// Binds every queue of `registry`, stopping at the first failure.
    pub async fn consume_all(&self, registry: &HandlerRegistry) -> Result<(), AmqpError> {
        for (queue, handler) in registry.iter() {
            self.consume(queue, handler.clone()).await?;
        }
        Ok(())
    }

    pub fn bound_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = lock(&self.bindings).keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Waits for every binding task to finish, which happens once the broker
    /// resources are released.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.bindings)
            .drain()
            .filter_map(|(_, handle)| handle)
            .collect();

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "binding task failed");
            }
        }
    }
}

/// Opens the dedicated channel of a binding and starts consuming.
async fn open_binding(
    client: &BrokerClient,
    ctx: &BindingContext,
) -> Result<Consumer, AmqpError> {
    let queue = ctx.queue.name();
    let channel = Arc::new(client.create_channel().await?);

    if let Err(err) = channel
        .basic_qos(ctx.prefetch, BasicQosOptions { global: false })
        .await
    {
        error!(error = err.to_string(), queue, "failure to configure qos");
        return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
    }

    client.register_channel(channel.clone());

    topology::declare_queue(&channel, queue).await?;

    let consumer_tag = format!("{queue}-{}", Uuid::new_v4());

    match channel
        .basic_consume(
            queue,
            &consumer_tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue, "error to create the consumer");
            Err(AmqpError::BindingConsumerError(queue.to_owned()))
        }
        Ok(consumer) => {
            info!(queue, prefetch = ctx.prefetch, "waiting for messages");
            Ok(consumer)
        }
    }
}

/// Consumes until the stream ends, then re-binds until the client closes.
///
/// `reopen` opens a fresh consumer on the current connection. It runs after the next
/// connection generation, or after [`RECONNECT_DELAY`] when the connection itself
/// survived.
async fn supervise_binding<S, M, F, Fut>(
    client: Arc<BrokerClient>,
    ctx: Arc<BindingContext>,
    consumer: S,
    mut reopen: F,
) where
    S: Stream<Item = Result<M, lapin::Error>> + Unpin,
    M: InboundMessage,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, AmqpError>>,
{
    let queue = ctx.queue.name().to_owned();
    let mut generation = client.subscribe_generation();
    generation.borrow_and_update();

    let mut consumer = Some(consumer);

    loop {
        if let Some(stream) = consumer.take() {
            run_deliveries(ctx.clone(), stream).await;
        }

        if client.is_closing() || client.lifecycle().current() == LifecycleState::Closed {
            info!(queue = %queue, "binding stopped");
            return;
        }

        warn!(queue = %queue, "delivery stream ended, re-binding");

        tokio::select! {
            changed = generation.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = client.lifecycle().closed() => {
                info!(queue = %queue, "binding stopped");
                return;
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }

        if client.is_closing() {
            info!(queue = %queue, "binding stopped");
            return;
        }

        match reopen().await {
            Ok(stream) => consumer = Some(stream),
            Err(err) => error!(error = err.to_string(), queue = %queue, "re-binding failed"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
