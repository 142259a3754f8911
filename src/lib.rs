// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod drain;
pub mod errors;
pub mod handler;
pub mod logging;
pub mod notifications;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod topology;
