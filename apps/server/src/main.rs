//! confab-server: multi-tenant real-time audio transcription over WebRTC,
//! with streamed transcripts and AI follow-up suggestions pushed back over
//! the signaling socket.

mod config;
mod http;
mod rtc;
mod state;
mod ws;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use confab_analysis::{Analyzer, LlmAnalyzer, LlmConfig, PoolConfig, ScriptedAnalyzer, WorkerPool};
use confab_pipeline::{RecordingConsumer, TranscriberConsumer};
use confab_session::{AudioConsumer, CoalescerConfig, SessionManager};
use confab_storage::{Database, ProjectStore};
use confab_stt::{DeepgramConfig, DeepgramFactory, RecognizerFactory, VoskFactory};
use confab_tickets::TicketStore;

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Arc::new(Config::from_env()?);
    std::fs::create_dir_all(&config.audio_recordings_dir)
        .context("creating recordings directory")?;

    let store: Arc<dyn ProjectStore> =
        Arc::new(Database::open(&config.database_path).context("opening database")?);
    let tickets = Arc::new(TicketStore::new(Duration::from_secs(config.ticket_ttl_secs)));

    let factory = recognizer_factory(&config)?;
    let consumers: Vec<Arc<dyn AudioConsumer>> = vec![
        Arc::new(RecordingConsumer::new(
            &config.audio_recordings_dir,
            config.target_sample_rate,
        )),
        Arc::new(TranscriberConsumer::new(factory, Arc::clone(&store))),
    ];

    let (job_tx, job_rx) = mpsc::channel(config.ai_job_queue_capacity);
    let manager = SessionManager::new(
        consumers,
        job_tx,
        CoalescerConfig {
            word_threshold: config.process_transcript_every_word_count,
            window: Duration::from_secs(config.process_transcript_every_secs),
        },
    );

    let pool = WorkerPool::start(
        PoolConfig {
            workers: config.ai_worker_count,
            queue_capacity: config.ai_job_queue_capacity,
        },
        job_rx,
        analyzer(&config),
        Arc::clone(&manager),
        Arc::clone(&store),
    );

    let app_state = AppState {
        config: Arc::clone(&config),
        manager: Arc::clone(&manager),
        tickets,
        store,
        connections: Arc::new(AtomicUsize::new(0)),
    };

    {
        // Periodic health logging, matching ops expectations for long-lived
        // deployments.
        let state = app_state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await;
            loop {
                interval.tick().await;
                let sessions = state.manager.active_session_count().await;
                tracing::info!(
                    sessions = sessions,
                    connections = state.connections.load(Ordering::Relaxed),
                    "health check"
                );
            }
        });
    }

    let app = Router::new()
        .route("/", get(http::root))
        .route("/health", get(http::health))
        .route("/stats", get(http::stats))
        .route("/api/ws-ticket", post(http::issue_ticket))
        .route("/ws", get(ws::upgrade))
        .layer(cors_layer(&config)?)
        .with_state(app_state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    pool.stop().await;
    tracing::info!("server shutdown complete");
    Ok(())
}

fn recognizer_factory(config: &Config) -> anyhow::Result<Arc<dyn RecognizerFactory>> {
    if let Some(model_path) = &config.vosk_model_path {
        tracing::info!(path = %model_path.display(), "using local vosk transcription");
        return Ok(Arc::new(VoskFactory::new(model_path.clone())));
    }
    if let Some(api_key) = &config.deepgram_api_key {
        tracing::info!("using deepgram streaming transcription");
        return Ok(Arc::new(DeepgramFactory::new(DeepgramConfig::new(
            api_key.clone(),
        ))));
    }
    anyhow::bail!("no transcription backend configured: set VOSK_MODEL_PATH or DEEPGRAM_API_KEY")
}

fn analyzer(config: &Config) -> Arc<dyn Analyzer> {
    match (&config.analyzer_api_url, &config.analyzer_api_key) {
        (Some(api_url), Some(api_key)) => Arc::new(LlmAnalyzer::new(LlmConfig {
            api_url: api_url.clone(),
            api_key: api_key.clone(),
            model: config.analyzer_model.clone(),
        })),
        _ => {
            tracing::warn!("ANALYZER_API_URL/ANALYZER_API_KEY not set, using scripted analyzer");
            Arc::new(ScriptedAnalyzer::default())
        }
    }
}

fn cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let origins = config
        .cors_allow_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS origin: {origin}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "shutdown signal listener failed");
    }
    tracing::info!("shutdown signal received");
}
