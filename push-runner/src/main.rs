use anyhow::Result;
use push_api::ApiState;
use push_core::{Config, PushContext};
use push_delivery::{Dispatcher, GatewayRouter};
use push_registry::TokenRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    tracing::info!("Starting push relay");

    let config = Config::from_env();
    let ctx = PushContext::new(config).await?;

    let registry = Arc::new(TokenRegistry::from_context(&ctx));
    let gateways = Arc::new(GatewayRouter::from_config(&ctx.config.delivery)?);
    let dispatcher = Dispatcher::new(registry, gateways, ctx.config.dispatch.clone());

    tracing::info!("Push context initialized");

    let shutdown = CancellationToken::new();

    let consumer = match ctx.config.redpanda.clone() {
        Some(redpanda) => {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = push_delivery::run(redpanda, dispatcher, shutdown).await {
                    tracing::error!("Delivery consumer error: {}", e);
                }
            }))
        }
        None => {
            tracing::info!("REDPANDA_BROKERS not set, delivery consumer disabled");
            None
        }
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                signal.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let state = ApiState::new(dispatcher, &ctx.config.server.jwt_secret);
    let served = push_api::run(state, &ctx.config.server, shutdown.clone()).await;
    shutdown.cancel();

    if let Some(handle) = consumer {
        if let Err(e) = handle.await {
            tracing::error!("Delivery consumer task failed: {}", e);
        }
    }

    served
}
