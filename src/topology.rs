// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Topology
//!
//! Idempotent declarations of the queues the worker relies on. Every queue is
//! durable. The delay queue carries dead-letter arguments that route expired
//! messages back to its work queue through the default exchange, which is how a
//! retry delay is enforced broker-side without any timer in the process.

use crate::{errors::AmqpError, queue::QueueDefinition};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel, Queue,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// The default (nameless) exchange routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: true,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    }
}

/// Declares a plain durable queue and returns the broker's view of it.
///
/// The returned [`Queue`] carries the number of ready messages, which makes this
/// call double as a non-destructive inspection.
pub async fn declare_queue(channel: &Channel, name: &str) -> Result<Queue, AmqpError> {
    match channel
        .queue_declare(name, durable(), FieldTable::default())
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue = name, "failure to declare queue");
            Err(AmqpError::DeclareQueueError(name.to_owned()))
        }
        Ok(queue) => {
            debug!(queue = name, "queue declared");
            Ok(queue)
        }
    }
}

/// Arguments of the delay queue paired with `def`.
pub fn delayed_queue_args(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(DEFAULT_EXCHANGE)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(def.name.clone())),
    );

    FieldTable::from(args)
}

/// Declares the delay queue of `def` and then the work queue itself.
///
/// Both must exist before a message is parked in the delay queue, otherwise an
/// expired message would be dead-lettered to nowhere.
pub async fn declare_delayed_queue(
    channel: &Channel,
    def: &QueueDefinition,
) -> Result<(), AmqpError> {
    match channel
        .queue_declare(&def.delayed_name, durable(), delayed_queue_args(def))
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = %def.delayed_name,
                "failure to declare delayed queue"
            );
            Err(AmqpError::DeclareQueueError(def.delayed_name.clone()))
        }
        _ => Ok(()),
    }?;

    declare_queue(channel, &def.name).await.map(|_| ())
}
