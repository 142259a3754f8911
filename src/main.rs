// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_worker::{
    configs::Configs,
    connection::BrokerClient,
    dispatcher::RabbitMQDispatcher,
    drain::Drainer,
    logging, notifications,
    publisher::RabbitMQPublisher,
    shutdown::{GracefulShutdown, OsSignals, EXIT_FAILURE, EXIT_OK},
};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cfg = match Configs::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    logging::setup(&cfg.app);
    cfg.log_summary();

    std::process::exit(run(cfg).await);
}

async fn run(cfg: Configs) -> i32 {
    let mut signals = match OsSignals::register() {
        Ok(signals) => signals,
        Err(err) => {
            error!(error = err.to_string(), "fatal: could not listen for termination signals");
            return EXIT_FAILURE;
        }
    };

    let client = match BrokerClient::connect(&cfg).await {
        Ok(client) => client,
        Err(err) => {
            error!(error = err.to_string(), "fatal: could not connect to the broker");
            return EXIT_FAILURE;
        }
    };

    if !client.is_connected() {
        info!("waiting for the broker");
        client.first_connection().await;
    }

    let publisher = RabbitMQPublisher::new(client.clone(), cfg.consumer.delay());
    let dispatcher = RabbitMQDispatcher::new(client.clone(), publisher, &cfg.consumer);

    let registry = notifications::default_registry();

    if let Err(err) = dispatcher.consume_all(&registry).await {
        error!(error = err.to_string(), "fatal: could not bind consumers");
        return EXIT_FAILURE;
    }

    info!(queues = ?registry.queues(), "worker started");

    signals.recv().await;

    let drainer = Drainer::new(
        client.clone(),
        client.lifecycle().clone(),
        registry.queues(),
        dispatcher.in_flight(),
    );

    let code = GracefulShutdown::new(drainer).run_to_exit_code().await;

    // bindings only finish once their channels are closed
    if code == EXIT_OK {
        dispatcher.join().await;
    }

    info!(code, "worker stopped");
    code
}
