// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Log consumer: writes every `producer_log` event to the consumer log file
//! until Ctrl-C.

use exchange_connector::{
    config::Configs,
    log_consumer::{self, TracingSink},
    logging, AmqpError, ExchangeConnector,
};
use std::{process, sync::Arc};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cfg = match Configs::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            process::exit(1);
        }
    };

    match logging::setup_file_logging(&cfg.app) {
        Ok(path) => info!(path = %path.display(), "logging to file"),
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    }

    let connector = ExchangeConnector::new(cfg, log_consumer::exchange());
    if let Err(err) = run(&connector).await {
        error!(error = err.to_string(), "consumer failed");
        eprintln!("consumer failed: {err}");
        process::exit(1);
    }
}

async fn run(connector: &ExchangeConnector) -> Result<(), AmqpError> {
    connector
        .scope(|session| {
            Box::pin(async move {
                let stop = session.stop_handle();
                tokio::spawn(async move {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = err.to_string(), "failure to listen for ctrl-c");
                        return;
                    }
                    stop.stop();
                });

                println!("Consumer started...");
                let result = log_consumer::run(session, Arc::new(TracingSink)).await;
                println!("...Consumer stopped");
                result
            })
        })
        .await
}
