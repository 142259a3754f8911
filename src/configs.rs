// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Configuration
//!
//! Typed configuration loaded once at startup. Broker and consumer keys are
//! required: the worker refuses to start rather than guessing a retry budget or a
//! delay. Application keys fall back to defaults.

use std::{env, time::Duration};
use thiserror::Error;

pub const ENV_APP_NAME: &str = "APP_NAME";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";
pub const ENV_RABBITMQ_URL: &str = "RABBITMQ_URL";
pub const ENV_CONSUMER_PREFETCH: &str = "CONSUMER_PREFETCH";
pub const ENV_CONSUMER_MAX_RETRY_COUNT: &str = "CONSUMER_MAX_RETRY_COUNT";
pub const ENV_CONSUMER_DELAY_MINUTES: &str = "CONSUMER_DELAY_MINUTES";

const DEFAULT_APP_NAME: &str = "rabbitmq-worker";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors raised while loading configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigsError {
    /// A required key is absent
    #[error("missing required env `{0}`")]
    Missing(&'static str),

    /// A key is present but cannot be parsed
    #[error("env `{var}`={raw:?} - expected {expected}")]
    Parse {
        var: &'static str,
        raw: String,
        expected: &'static str,
    },

    /// A key parsed but violates a constraint
    #[error("env `{var}`: {message}")]
    InvalidValue { var: &'static str, message: String },
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfigs {
    /// Also used as the AMQP connection name.
    pub name: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMQConfigs {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfigs {
    /// Maximum unacknowledged deliveries per binding.
    pub prefetch: u16,
    /// Failures tolerated before a message is quarantined.
    pub max_retry_count: i64,
    /// Fixed delay before a failed message is redelivered.
    pub delay_minutes: u64,
}

/// Largest delay whose TTL in milliseconds still fits the broker's 32-bit expiration.
pub const MAX_DELAY_MINUTES: u64 = u32::MAX as u64 / 60_000;

impl ConsumerConfigs {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub consumer: ConsumerConfigs,
}

impl Configs {
    /// Loads the configuration from process environment variables.
    pub fn from_env() -> Result<Configs, ConfigsError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads the configuration through `lookup`, which returns the raw value of a key.
    pub fn from_lookup<F>(lookup: F) -> Result<Configs, ConfigsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = lookup(ENV_APP_NAME).unwrap_or_else(|| DEFAULT_APP_NAME.to_owned());
        validate(ENV_APP_NAME, !name.trim().is_empty(), "must not be empty")?;

        let log_level = lookup(ENV_LOG_LEVEL).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned());

        let log_format = match lookup(ENV_LOG_FORMAT) {
            None => LogFormat::default(),
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigsError::Parse {
                        var: ENV_LOG_FORMAT,
                        raw,
                        expected: "`text` or `json`",
                    })
                }
            },
        };

        let url = required(&lookup, ENV_RABBITMQ_URL)?;
        validate(ENV_RABBITMQ_URL, !url.trim().is_empty(), "must not be empty")?;

        let prefetch: u16 = parse(&lookup, ENV_CONSUMER_PREFETCH, "integer in 1..=65535")?;
        validate(ENV_CONSUMER_PREFETCH, prefetch >= 1, "must be >= 1")?;

        let max_retry_count: i64 =
            parse(&lookup, ENV_CONSUMER_MAX_RETRY_COUNT, "non-negative integer")?;
        validate(ENV_CONSUMER_MAX_RETRY_COUNT, max_retry_count >= 0, "must be >= 0")?;

        let delay_minutes: u64 =
            parse(&lookup, ENV_CONSUMER_DELAY_MINUTES, "positive integer")?;
        validate(ENV_CONSUMER_DELAY_MINUTES, delay_minutes >= 1, "must be >= 1")?;
        validate(
            ENV_CONSUMER_DELAY_MINUTES,
            delay_minutes <= MAX_DELAY_MINUTES,
            "must be <= 71582",
        )?;

        Ok(Configs {
            app: AppConfigs {
                name,
                log_level,
                log_format,
            },
            rabbitmq: RabbitMQConfigs { url },
            consumer: ConsumerConfigs {
                prefetch,
                max_retry_count,
                delay_minutes,
            },
        })
    }

    /// Logs the loaded values, leaving the broker URL out since it carries credentials.
    pub fn log_summary(&self) {
        tracing::info!(
            app = %self.app.name,
            prefetch = self.consumer.prefetch,
            max_retry_count = self.consumer.max_retry_count,
            delay_minutes = self.consumer.delay_minutes,
            "configuration loaded"
        );
    }
}

fn required<F>(lookup: &F, var: &'static str) -> Result<String, ConfigsError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var).ok_or(ConfigsError::Missing(var))
}

fn parse<F, T>(lookup: &F, var: &'static str, expected: &'static str) -> Result<T, ConfigsError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = required(lookup, var)?;
    raw.trim().parse::<T>().map_err(|_| ConfigsError::Parse {
        var,
        raw,
        expected,
    })
}

fn validate(var: &'static str, condition: bool, message: &str) -> Result<(), ConfigsError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigsError::InvalidValue {
            var,
            message: message.to_owned(),
        })
    }
}
