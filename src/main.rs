//! # Captions Relay - Main Application Entry Point
//!
//! Real-time translation relay for live captioning. Browser clients connect
//! over WebSocket, send text to translate, and receive translations produced
//! by an external speech-translation backend reached over a single shared
//! WebSocket connection.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **upstream**: the supervised connection to the translation backend
//! - **relay**: client sessions and correlation of backend results
//! - **websocket**: the per-client WebSocket actor
//! - **store**: in-memory translation history
//! - **handlers**: history HTTP API
//! - **health**: health endpoint
//! - **middleware**: request logging
//! - **error**: HTTP error responses

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod state;
mod store;
mod upstream;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use relay::Relay;
use state::AppState;
use std::sync::Arc;
use store::MemoryStore;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::{LinkState, UpstreamLink};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        source = %config.upstream.source_language,
        target = %config.upstream.target_language,
        "Configuration loaded"
    );

    let link = Arc::new(UpstreamLink::new(config.upstream.clone()));
    let store = Arc::new(MemoryStore::new());
    let relay = Arc::new(Relay::new(link.clone(), store, &config.relay));
    let supervisor = link.spawn();
    watch_link(&link);

    let app_state = AppState::new(config.clone(), relay);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestLogging)
            .route(
                "/voice-translation",
                web::get().to(websocket::voice_translation),
            )
            .service(
                web::scope("/api")
                    .route(
                        "/transcriptions",
                        web::get().to(handlers::list_transcriptions),
                    )
                    .route(
                        "/transcriptions",
                        web::delete().to(handlers::clear_transcriptions),
                    )
                    .route(
                        "/transcriptions/audio",
                        web::post().to(handlers::send_audio),
                    )
                    .route("/v1/health", web::get().to(health::health_check)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    link.shutdown();
    if let Some(supervisor) = supervisor {
        if let Err(e) = supervisor.await {
            warn!("Upstream supervisor ended abnormally: {}", e);
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Log when the translation backend becomes available or is lost.
fn watch_link(link: &UpstreamLink) {
    let mut states = link.subscribe_state();
    tokio::spawn(async move {
        let mut previous = *states.borrow_and_update();
        while states.changed().await.is_ok() {
            let current = *states.borrow_and_update();
            match (previous, current) {
                (_, LinkState::Ready) => info!("Translation backend available"),
                (LinkState::Ready, _) => warn!("Translation backend connection lost"),
                _ => {}
            }
            previous = current;
        }
    });
}

/// `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "captions_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialize tracing")?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
