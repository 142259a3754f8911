// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Notification Handlers
//!
//! Handlers bound to the `MAIL` and `SMS` queues. Each decodes a JSON payload and
//! hands the message to a [`NotificationTransport`]. A payload that cannot be
//! decoded is a handler failure like any other, so it goes through the retry path
//! and ends in the error queue.

use crate::{
    errors::HandlerError,
    handler::{ConsumerHandler, HandlerRegistry},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{marker::PhantomData, sync::Arc};
use tracing::info;

pub const MAIL_QUEUE: &str = "MAIL";
pub const SMS_QUEUE: &str = "SMS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub to: String,
    pub text: String,
}

/// A decoded notification that can be checked before sending.
pub trait Notification: DeserializeOwned + Send + Sync + 'static {
    fn recipient(&self) -> &str;
}

impl Notification for MailMessage {
    fn recipient(&self) -> &str {
        &self.to
    }
}

impl Notification for SmsMessage {
    fn recipient(&self) -> &str {
        &self.to
    }
}

/// Delivery of notifications to the outside world.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send_mail(&self, ctx: &Context, mail: &MailMessage) -> Result<(), HandlerError>;

    async fn send_sms(&self, ctx: &Context, sms: &SmsMessage) -> Result<(), HandlerError>;
}

/// Transport that only logs what it would send.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send_mail(&self, _: &Context, mail: &MailMessage) -> Result<(), HandlerError> {
        info!(to = %mail.to, subject = %mail.subject, "mail sent");
        Ok(())
    }

    async fn send_sms(&self, _: &Context, sms: &SmsMessage) -> Result<(), HandlerError> {
        info!(to = %sms.to, chars = sms.text.chars().count(), "sms sent");
        Ok(())
    }
}

/// Decodes a notification of type `N` and sends it through the transport.
pub struct NotificationHandler<N> {
    transport: Arc<dyn NotificationTransport>,
    _kind: PhantomData<fn() -> N>,
}

impl<N> NotificationHandler<N> {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        NotificationHandler {
            transport,
            _kind: PhantomData,
        }
    }
}

fn decode<N: Notification>(payload: &[u8]) -> Result<N, HandlerError> {
    let message: N = serde_json::from_slice(payload)
        .map_err(|err| HandlerError::InvalidPayload(err.to_string()))?;

    if message.recipient().trim().is_empty() {
        return Err(HandlerError::InvalidPayload("empty recipient".to_owned()));
    }

    Ok(message)
}

#[async_trait]
impl ConsumerHandler for NotificationHandler<MailMessage> {
    async fn exec(&self, ctx: &Context, payload: &[u8]) -> Result<(), HandlerError> {
        let mail: MailMessage = decode(payload)?;
        self.transport.send_mail(ctx, &mail).await
    }
}

#[async_trait]
impl ConsumerHandler for NotificationHandler<SmsMessage> {
    async fn exec(&self, ctx: &Context, payload: &[u8]) -> Result<(), HandlerError> {
        let sms: SmsMessage = decode(payload)?;
        self.transport.send_sms(ctx, &sms).await
    }
}

/// Registry with the `MAIL` and `SMS` handlers sharing `transport`.
pub fn registry(transport: Arc<dyn NotificationTransport>) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            MAIL_QUEUE,
            Arc::new(NotificationHandler::<MailMessage>::new(transport.clone())),
        )
        .register(
            SMS_QUEUE,
            Arc::new(NotificationHandler::<SmsMessage>::new(transport)),
        )
}

pub fn default_registry() -> HandlerRegistry {
    registry(Arc::new(LogTransport))
}
