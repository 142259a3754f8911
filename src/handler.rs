// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler receives the raw payload of one message and either succeeds or fails.
//! The worker owns everything around the call: acknowledging, delaying retries and
//! quarantining. The [`HandlerRegistry`] maps each work queue to its handler.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::warn;

/// Business logic bound to a work queue.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one payload. `ctx` is the trace context the message was published with.
    async fn exec(&self, ctx: &Context, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Ordered mapping from work queue name to handler, one handler per queue.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Vec<(String, Arc<dyn ConsumerHandler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `queue`, replacing any handler registered before.
    pub fn register(mut self, queue: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        if let Some(entry) = self.entries.iter_mut().find(|(name, _)| name == queue) {
            warn!(queue, "handler replaced");
            entry.1 = handler;
        } else {
            self.entries.push((queue.to_owned(), handler));
        }
        self
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn ConsumerHandler>> {
        self.entries
            .iter()
            .find(|(name, _)| name == queue)
            .map(|(_, handler)| handler.clone())
    }

    /// Queue names in registration order.
    pub fn queues(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ConsumerHandler>)> {
        self.entries
            .iter()
            .map(|(name, handler)| (name.as_str(), handler))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
