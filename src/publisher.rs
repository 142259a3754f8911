// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes on the default exchange straight into a named queue, either right away
//! or after a delay. Delays are enforced by the broker: the message sits in
//! `<queue>_delayed` with a per-message expiration and is dead-lettered back into
//! `<queue>` when it expires, so pending retries survive a worker restart.
//!
//! Each publish uses a short-lived channel of its own; long-lived channels are
//! reserved for consumer bindings.

use crate::{
    connection::BrokerClient,
    errors::{is_expected_error, AmqpError},
    otel,
    queue::QueueDefinition,
    retry::AMQP_HEADERS_RETRY_COUNT,
    topology::{self, DEFAULT_EXCHANGE},
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{global, Context};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info};
use uuid::Uuid;

/// AMQP delivery mode of messages written to disk by the broker.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Typed header values accepted by [`PublishOptions`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    LongString(String),
    LongInt(i32),
    LongLongInt(i64),
    Bool(bool),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

/// Per-message publishing options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub headers: BTreeMap<String, HeaderValue>,
    pub persistent: bool,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
}

impl PublishOptions {
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Options carrying only the retry counter.
    pub fn with_retry_count(retry_count: i64) -> Self {
        PublishOptions::default().header(
            AMQP_HEADERS_RETRY_COUNT,
            HeaderValue::LongLongInt(retry_count),
        )
    }

    pub fn retry_count(&self) -> Option<i64> {
        match self.headers.get(AMQP_HEADERS_RETRY_COUNT) {
            Some(HeaderValue::LongLongInt(v)) => Some(*v),
            Some(HeaderValue::LongInt(v)) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Adds the propagation fields of `ctx`, taking precedence over the current context.
    pub fn with_trace(mut self, ctx: &Context) -> Self {
        let mut fields: HashMap<String, String> = HashMap::new();
        global::get_text_map_propagator(|propagator| propagator.inject_context(ctx, &mut fields));

        for (key, value) in fields {
            self.headers.insert(key, HeaderValue::LongString(value));
        }
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Builds the AMQP properties, injecting the trace context of `ctx` into the headers.
    pub(crate) fn properties(&self, ctx: &Context) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

        otel::inject(ctx, &mut headers);

        for (key, value) in &self.headers {
            headers.insert(ShortString::from(key.clone()), value.clone().into());
        }

        let mut props = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        if let Some(ttl) = self.expiration {
            props = props.with_expiration(ShortString::from(ttl.as_millis().to_string()));
        }

        props
    }
}

/// Sends messages to work queues.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `payload` to `queue`; it is visible to consumers immediately.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        opts: PublishOptions,
    ) -> Result<(), AmqpError>;

    /// Publishes `payload` so that it reaches `queue` only after the configured delay.
    async fn publish_delayed(
        &self,
        queue: &str,
        payload: &[u8],
        opts: PublishOptions,
    ) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the [`Publisher`] trait.
///
/// Publishes through the default exchange and waits for the broker confirm of every
/// message. Delayed messages go through the `<queue>_delayed` queue with the
/// configured TTL.
pub struct RabbitMQPublisher {
    client: Arc<BrokerClient>,
    delay: Duration,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `client` - Broker client the publish channels are opened on
    /// * `delay` - How long delayed messages wait before reaching their queue
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(client: Arc<BrokerClient>, delay: Duration) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { client, delay })
    }

    async fn send(
        &self,
        channel: &Channel,
        queue: &str,
        payload: &[u8],
        opts: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let props = opts.properties(&Context::current());

        let confirm = channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                props,
            )
            .await;

        match confirm {
            Ok(confirm) => match confirm.await {
                Ok(_) => Ok(()),
                Err(err) => {
                    error!(error = err.to_string(), queue, "error publishing message");
                    Err(AmqpError::PublishingError(queue.to_owned()))
                }
            },
            Err(err) => {
                error!(error = err.to_string(), queue, "error publishing message");
                Err(AmqpError::PublishingError(queue.to_owned()))
            }
        }
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        opts: PublishOptions,
    ) -> Result<(), AmqpError> {
        let channel = self.client.create_channel().await?;

        let result = match topology::declare_queue(&channel, queue).await {
            Ok(_) => self.send(&channel, queue, payload, &opts).await,
            Err(err) => Err(err),
        };

        close_quietly(&channel).await;

        if result.is_ok() {
            info!(queue, "message added to queue");
        }
        result
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        payload: &[u8],
        opts: PublishOptions,
    ) -> Result<(), AmqpError> {
        let def = QueueDefinition::new(queue);
        let opts = opts.persistent().expiration(self.delay);

        let channel = self.client.create_channel().await?;

        let result = match topology::declare_delayed_queue(&channel, &def).await {
            Ok(()) => self.send(&channel, def.delayed_name(), payload, &opts).await,
            Err(err) => Err(err),
        };

        close_quietly(&channel).await;

        if result.is_ok() {
            debug!(
                queue,
                delayed_queue = def.delayed_name(),
                ttl_ms = self.delay.as_millis() as u64,
                "message parked until redelivery"
            );
        }
        result
    }
}

async fn close_quietly(channel: &Channel) {
    match channel.close(200, "publish done").await {
        Ok(()) => {}
        Err(err) if is_expected_error(&err) => {
            debug!(error = err.to_string(), "publish channel already closing")
        }
        Err(err) => error!(error = err.to_string(), "error closing publish channel"),
    }
}
