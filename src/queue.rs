// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Work Queue Definitions
//!
//! Every work queue `Q` is backed by three broker queues:
//! - `Q`: the primary queue handlers consume from,
//! - `Q_delayed`: a holding queue nobody consumes; messages expire there and the
//!   broker dead-letters them back into `Q`,
//! - `Q_errors`: the sink for quarantined messages, kept for manual inspection.

/// Suffix of the delay queue paired with a work queue.
pub const DELAYED_QUEUE_SUFFIX: &str = "_delayed";
/// Suffix of the error sink paired with a work queue.
pub const ERRORS_QUEUE_SUFFIX: &str = "_errors";

/// Names of the broker queues backing one work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) delayed_name: String,
    pub(crate) errors_name: String,
}

impl QueueDefinition {
    /// Creates the definition for the work queue `name`.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            delayed_name: format!("{name}{DELAYED_QUEUE_SUFFIX}"),
            errors_name: format!("{name}{ERRORS_QUEUE_SUFFIX}"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue that holds a message until its TTL expires.
    pub fn delayed_name(&self) -> &str {
        &self.delayed_name
    }

    /// Queue that receives messages which exhausted their retries.
    pub fn errors_name(&self) -> &str {
        &self.errors_name
    }
}
