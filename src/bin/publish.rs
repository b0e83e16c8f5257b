// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Publishes a single message, e.g.
//! `publish --routing-key user.info --body "user created"`.

use clap::Parser;
use exchange_connector::{
    config::Configs,
    exchange::{ExchangeDefinition, ExchangeKind},
    log_consumer::PRODUCER_LOG_EXCHANGE,
    logging,
    publisher::Publisher,
    ExchangeConnector,
};
use opentelemetry::Context;
use std::process;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "publish", about = "Publish one message to an exchange")]
struct Args {
    /// Routing key, e.g. user.info or order.error
    #[arg(long, default_value = "")]
    routing_key: String,

    /// Message body, sent as UTF-8 bytes
    #[arg(long)]
    body: String,

    #[arg(long, env = "EXCHANGE_NAME", default_value = PRODUCER_LOG_EXCHANGE)]
    exchange: String,

    /// fanout, direct or topic
    #[arg(long, default_value = "topic")]
    kind: ExchangeKind,

    #[arg(long)]
    content_type: Option<String>,

    /// Print the resolved configuration as JSON and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let cfg = match Configs::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            process::exit(1);
        }
    };

    if args.show_config {
        match serde_json::to_string_pretty(&cfg) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("{err}");
                process::exit(1);
            }
        }
        return;
    }

    if let Err(err) = logging::setup_logging(&cfg.app) {
        eprintln!("{err}");
        process::exit(1);
    }

    let exchange = ExchangeDefinition::new(&args.exchange).kind(args.kind);
    let connector = ExchangeConnector::new(cfg, exchange);

    let routing_key = args.routing_key.clone();
    let body = args.body.clone();
    let content_type = args.content_type.clone();

    let res = connector
        .scope(move |session| {
            Box::pin(async move {
                let mut publisher = session.publisher();
                if let Some(content_type) = &content_type {
                    publisher = publisher.content_type(content_type);
                }

                publisher
                    .publish(&Context::current(), &routing_key, body.as_bytes())
                    .await
            })
        })
        .await;

    match res {
        Ok(()) => info!(
            exchange = %args.exchange,
            routing_key = %args.routing_key,
            "message published"
        ),
        Err(err) => {
            error!(error = err.to_string(), "failure to publish");
            process::exit(1);
        }
    }
}
