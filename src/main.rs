mod api;
mod config;
mod error;
mod models;
mod services;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::Config;
use crate::services::library::Library;
use crate::services::llm::LLMClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    if config.api_key.is_none() {
        tracing::warn!("ANTHROPIC_API_KEY is not set; generation requests will fail");
    }

    let llm_client = Arc::new(LLMClient::new(&config)?);
    let library = Arc::new(
        Library::open(&config.database_path)
            .with_context(|| format!("opening library at {}", config.database_path))?,
    );

    let state = api::AppState::new(llm_client, &config, library);
    api::spawn_session_sweeper(state.clone());

    let app = api::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(tower_http::cors::Any)
                    .allow_methods(tower_http::cors::AllowMethods::any())
                    .allow_headers(tower_http::cors::AllowHeaders::any()),
            ),
    );

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(
        outline_model = %config.outline_model,
        chapter_model = %config.chapter_model,
        "Listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;

    Ok(())
}
