// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::configs::{AppConfigs, LogFormat};
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured log level applies. Calling it
/// twice is a no-op.
pub fn setup(cfg: &AppConfigs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},lapin=warn", cfg.log_level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = match cfg.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}
