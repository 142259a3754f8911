// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Per-message protocol of a consumer binding:
//! 1. run the handler with the payload,
//! 2. on success acknowledge the delivery,
//! 3. on failure bump the retry counter, then either park a copy in the delay queue
//!    or move a copy to the error sink, and reject the original without requeueing
//!    so the work is not duplicated.
//!
//! Deliveries of one binding are processed concurrently, bounded by the prefetch
//! count. Acknowledgements may therefore complete out of delivery order.

use crate::{
    errors::AmqpError,
    handler::ConsumerHandler,
    otel,
    publisher::{PublishOptions, Publisher},
    queue::QueueDefinition,
    retry::{extract_retry_count, RetryDecision, RetryPolicy},
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicRejectOptions},
    types::FieldTable,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status, TraceContextExt},
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error};

/// A delivery as seen by the consumer protocol.
#[async_trait]
pub trait InboundMessage: Send + Sync + 'static {
    fn payload(&self) -> &[u8];

    fn headers(&self) -> FieldTable;

    /// Removes the message from its queue.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the message; with `requeue` the broker delivers it again.
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl InboundMessage for Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    /// A copy was parked in the delay queue, the original rejected.
    Delayed { retry_count: i64 },
    /// A copy was moved to the error sink, the original rejected.
    Quarantined { retry_count: i64 },
    /// The copy could not be published; the original was rejected anyway.
    RedirectFailed,
}

/// Counts messages currently held by handlers, across all bindings.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn enter(&self) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.0.clone())
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a binding needs to process its deliveries.
#[derive(Clone)]
pub struct BindingContext {
    pub(crate) queue: QueueDefinition,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) policy: RetryPolicy,
    pub(crate) prefetch: u16,
    pub(crate) in_flight: InFlight,
}

/// Runs the per-message protocol for one delivery.
pub(crate) async fn consume<M: InboundMessage>(
    tracer: &BoxedTracer,
    ctx: &BindingContext,
    msg: &M,
) -> Result<Outcome, AmqpError> {
    let queue = ctx.queue.name();
    let headers = msg.headers();
    let (otel_ctx, mut span) = otel::new_span(&headers, tracer, queue);

    debug!(queue, "received message");

    let result = ctx.handler.exec(&otel_ctx, msg.payload()).await;

    let Err(handler_err) = result else {
        return match msg.ack().await {
            Ok(()) => {
                debug!(queue, "message successfully processed");
                span.set_status(Status::Ok);
                Ok(Outcome::Acked)
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(err)
            }
        };
    };

    span.record_error(&handler_err);

    let retry_count = extract_retry_count(&headers).saturating_add(1);
    let decision = ctx.policy.decide(retry_count);

    // The copy continues the trace of this attempt.
    let trace = otel_ctx.with_remote_span_context(span.span_context().clone());
    let opts = PublishOptions::with_retry_count(retry_count).with_trace(&trace);

    let published = match decision {
        RetryDecision::Quarantine { retry_count } => {
            error!(
                queue,
                retry_count,
                max_retry_count = ctx.policy.max_retry_count,
                error = handler_err.to_string(),
                "message rejected after {} retries",
                ctx.policy.max_retry_count
            );
            ctx.publisher
                .publish(ctx.queue.errors_name(), msg.payload(), opts)
                .await
                .map(|()| Outcome::Quarantined { retry_count })
        }
        RetryDecision::Delay { retry_count } => {
            error!(
                queue,
                retry_count,
                error = handler_err.to_string(),
                "message requeued after a {} min delay",
                ctx.policy.delay.as_secs() / 60
            );
            ctx.publisher
                .publish_delayed(queue, msg.payload(), opts)
                .await
                .map(|()| Outcome::Delayed { retry_count })
        }
    };

    match published {
        Ok(outcome) => {
            span.set_status(Status::Error {
                description: Cow::from(handler_err.to_string()),
            });
            msg.reject(false).await?;
            Ok(outcome)
        }
        Err(err) => {
            // Requeueing would redeliver at once without counting the attempt.
            error!(
                queue,
                retry_count,
                error = err.to_string(),
                "failure to redirect failed message, message dropped"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to redirect msg"),
            });
            msg.reject(false).await?;
            Ok(Outcome::RedirectFailed)
        }
    }
}

/// Processes a stream of deliveries until it ends.
///
/// Each delivery runs on its own task once a permit is available, so at most
/// `prefetch` messages are handled at the same time. Returns after the stream ended
/// and every started task finished.
pub(crate) async fn run_deliveries<S, M>(ctx: Arc<BindingContext>, mut deliveries: S)
where
    S: Stream<Item = Result<M, lapin::Error>> + Unpin,
    M: InboundMessage,
{
    let permits = Arc::new(Semaphore::new(usize::from(ctx.prefetch.max(1))));
    let mut tasks = JoinSet::new();

    while let Some(result) = deliveries.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                error!(error = err.to_string(), queue = ctx.queue.name(), "errors consume msg");
                continue;
            }
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let in_flight = ctx.in_flight.enter();
        let ctx = ctx.clone();

        tasks.spawn(async move {
            let tracer = global::tracer(otel::TRACER_NAME);
            if let Err(err) = consume(&tracer, &ctx, &msg).await {
                error!(error = err.to_string(), queue = ctx.queue.name(), "error consume msg");
            }
            drop(in_flight);
            drop(permit);
        });

        while tasks.try_join_next().is_some() {}
    }

    while tasks.join_next().await.is_some() {}
}
