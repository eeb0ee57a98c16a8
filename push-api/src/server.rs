use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{delete, get, post},
    Router,
};
use push_core::config::ServerConfig;
use std::env;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::handlers;
use crate::state::ApiState;

fn cors_layer() -> CorsLayer {
    match env::var("CORS_ORIGINS") {
        Ok(origins) => {
            let mut cors = CorsLayer::new();
            for origin in origins.split(',').map(str::trim) {
                if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(parsed);
                }
            }
            cors.allow_methods(Any).allow_headers(Any)
        }
        Err(_) => {
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS");
            CorsLayer::permissive()
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/v1/device-tokens",
            post(handlers::register_device_token).get(handlers::list_device_tokens),
        )
        .route(
            "/api/v1/device-tokens/:token",
            delete(handlers::unregister_device_token),
        )
        .route("/api/v1/stats/device-tokens", get(handlers::token_stats))
        .route("/api/v1/push/device", post(handlers::push_to_device))
        .route("/api/v1/push/user", post(handlers::push_to_user))
        .route("/api/v1/push/users", post(handlers::push_to_users))
        .route("/api/v1/push/topic", post(handlers::push_to_topic))
        .route("/api/v1/push/validate", post(handlers::validate_token))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer())
                .layer(Extension(state))
                .layer(middleware::from_fn(auth::auth_middleware)),
        )
}

pub async fn run(state: ApiState, config: &ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.api_port).parse()?;
    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}
