//! # Voice Chat Backend - Main Application Entry Point
//!
//! Real-time voice chat server: clients stream utterances over a WebSocket,
//! the server runs speech-to-text, chatbot completion and text-to-speech
//! against external providers, and streams the reply audio back. A REST
//! fallback covers clients that cannot hold a socket open.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + APP_* environment)
//! - **state**: shared app state, request and turn metrics
//! - **error**: the crate error taxonomy and its HTTP mapping
//! - **auth**: token → principal seam
//! - **session**: per-connection lifecycle, state machine, registry
//! - **audio**: utterance assembly from streamed PCM chunks
//! - **pipeline**: provider traits, HTTP providers, the turn orchestrator
//! - **websocket**: the per-connection actor speaking the voice protocol
//! - **handlers**: REST fallback and config endpoints
//! - **usage**: per-turn usage records for billing
//! - **client**: recorder + reconnecting transport for client tooling

mod audio;
mod auth;
mod client;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod session;
mod state;
mod usage;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use auth::{ApiKeyAuthenticator, Authenticator};
use config::AppConfig;
use pipeline::http::{HttpCompletionProvider, HttpSttProvider, HttpTtsProvider};
use pipeline::orchestrator::PipelineOrchestrator;
use pipeline::provider::{CompletionProvider, SttProvider, TtsProvider};
use session::manager::SessionManager;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usage::{TracingUsageSink, UsageSink};

/// Global shutdown flag set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-chat-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}",
        config.server.host, config.server.port
    );

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Provider stack shared by the orchestrator and the REST handlers.
    let http_client = reqwest::Client::new();
    let stt: Arc<dyn SttProvider> = Arc::new(HttpSttProvider::new(
        http_client.clone(),
        config.pipeline.stt_url.clone(),
    ));
    let llm: Arc<dyn CompletionProvider> = Arc::new(HttpCompletionProvider::new(
        http_client.clone(),
        config.pipeline.llm_url.clone(),
    ));
    let tts: Arc<dyn TtsProvider> = Arc::new(HttpTtsProvider::new(
        http_client,
        config.pipeline.tts_url.clone(),
    ));

    let orchestrator = web::Data::new(PipelineOrchestrator::new(
        Arc::clone(&stt),
        Arc::clone(&llm),
        Arc::clone(&tts),
        config.pipeline.clone(),
    ));
    let session_manager = web::Data::new(SessionManager::new(
        config.session.max_concurrent_sessions,
        config.session.history_limit,
    ));
    let usage_sink: web::Data<dyn UsageSink> =
        web::Data::from(Arc::new(TracingUsageSink) as Arc<dyn UsageSink>);
    let authenticator: web::Data<dyn Authenticator> =
        web::Data::from(Arc::new(ApiKeyAuthenticator) as Arc<dyn Authenticator>);
    let stt_data: web::Data<dyn SttProvider> = web::Data::from(stt);
    let tts_data: web::Data<dyn TtsProvider> = web::Data::from(tts);

    setup_signal_handlers();
    spawn_idle_sweep(session_manager.clone(), app_state.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let app_state_data = web::Data::new(app_state);
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state_data.clone())
            .app_data(session_manager.clone())
            .app_data(orchestrator.clone())
            .app_data(usage_sink.clone())
            .app_data(authenticator.clone())
            .app_data(stt_data.clone())
            .app_data(tts_data.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestMetrics)
            .wrap(middleware::RequestLogging)
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/voice/chat", web::post().to(handlers::voice_chat))
                    .route(
                        "/voice/transcribe",
                        web::post().to(handlers::voice_transcribe),
                    )
                    .route(
                        "/voice/synthesize",
                        web::post().to(handlers::voice_synthesize),
                    ),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_chat_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically drop sessions whose connections went away without a proper
/// close. Connected sessions are timed out by their own actor; this sweep
/// only catches registry orphans.
fn spawn_idle_sweep(manager: web::Data<SessionManager>, app_state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let idle_timeout = app_state.get_config().session.idle_timeout_secs;
            let expired = manager.sweep_idle(idle_timeout);
            if !expired.is_empty() {
                info!(count = expired.len(), "Swept idle sessions");
            }
        }
    });
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
