//! # Live Relay
//!
//! Relays real-time text, audio and image chunks between websocket clients
//! and the Gemini Live streaming API, one session per client.
//!
//! ## Routes:
//! - `GET /ws`: client relay connection
//! - `GET /health`, `GET /api/v1/health`: health check
//! - `GET /api/v1/metrics`: HTTP and session metrics
//! - `GET /api/v1/sessions[/{client_id}]`: live sessions
//! - `GET /api/v1/config`: effective configuration (API key masked)

mod config;
mod error;
mod handlers;
mod health;
mod media;
mod middleware;
mod session;
mod state;
mod upstream;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use session::lifecycle::LifecycleConfig;
use session::{LifecycleManager, SessionRegistry};
use state::AppState;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::GeminiConnector;

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.upstream.model,
        modality = %config.upstream.response_modality,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );
    if config.upstream.api_key.is_empty() {
        warn!("No API key configured (set API_KEY); upstream connections will be rejected");
    }
    if let Some(dir) = &config.debug.audio_record_dir {
        info!("Engine audio will be recorded to {} instead of sent to clients", dir);
    }

    // tokio-tungstenite needs a process-wide TLS crypto provider for wss://
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("TLS crypto provider already installed");
    }

    let manager = LifecycleManager::new(
        SessionRegistry::new(config.relay.max_concurrent_sessions),
        Arc::new(GeminiConnector::from_settings(&config.upstream)),
        LifecycleConfig::from_app_config(&config),
    );
    let app_state = AppState::new(config.clone(), manager.clone());
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
            .wrap(actix_web::middleware::from_fn(middleware::track_metrics))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/ws", web::get().to(websocket::relay_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{client_id}", web::get().to(handlers::get_session))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
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
            info!("Shutdown signal received, ending sessions and stopping server...");
            manager.shutdown().await;
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C only on non-unix targets).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
