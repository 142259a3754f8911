// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Worker
//!
//! `AmqpError` covers every broker-side operation the worker performs: connecting,
//! opening channels, declaring and inspecting queues, publishing, settling deliveries
//! and closing resources. `HandlerError` is what a message handler reports back to the
//! consumer; it never reaches the broker layer as a crash, it is turned into a retry or
//! quarantine decision instead.

use lapin::{ChannelState, ConnectionState};
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// An operation needed a connection while the client had none
    #[error("not connected")]
    NotConnected,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The queue already has an active consumer binding in this process
    #[error("queue `{0}` already has a consumer")]
    AlreadyBound(String),

    /// New bindings are refused once shutdown started
    #[error("worker is shutting down")]
    ShuttingDown,

    /// Error publishing a message to the given queue
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error reading the message count of a queue
    #[error("failure to inspect queue `{0}`")]
    InspectQueueError(String),

    /// Error closing a channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),
}

/// Errors a [`crate::handler::ConsumerHandler`] reports for a single message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload could not be decoded into what the handler expects
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The handler ran and failed
    #[error("{0}")]
    Failed(String),
}

/// Reports whether a lapin error is an expected close race.
///
/// Operations issued against a channel or connection that is already closing (or
/// gone) fail this way while a shutdown or reconnect is in progress. Those are logged
/// and swallowed; everything else is a real failure.
pub fn is_expected_error(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::InvalidChannelState(ChannelState::Closing | ChannelState::Closed)
            | lapin::Error::InvalidConnectionState(
                ConnectionState::Closing | ConnectionState::Closed
            )
            | lapin::Error::InvalidChannel(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_channel_is_expected() {
        assert!(is_expected_error(&lapin::Error::InvalidChannelState(
            ChannelState::Closing
        )));
        assert!(is_expected_error(&lapin::Error::InvalidChannelState(
            ChannelState::Closed
        )));
    }

    #[test]
    fn closing_connection_is_expected() {
        assert!(is_expected_error(&lapin::Error::InvalidConnectionState(
            ConnectionState::Closed
        )));
        assert!(is_expected_error(&lapin::Error::InvalidChannel(7)));
    }

    #[test]
    fn other_errors_are_not_expected() {
        assert!(!is_expected_error(&lapin::Error::ChannelsLimitReached));
        assert!(!is_expected_error(&lapin::Error::InvalidConnectionState(
            ConnectionState::Connecting
        )));
        assert!(!is_expected_error(&lapin::Error::InvalidChannelState(
            ChannelState::Connected
        )));
    }

    #[test]
    fn handler_error_displays_reason() {
        assert_eq!(HandlerError::Failed("smtp down".into()).to_string(), "smtp down");
        assert_eq!(
            HandlerError::InvalidPayload("missing `to`".into()).to_string(),
            "invalid payload: missing `to`"
        );
    }
}
