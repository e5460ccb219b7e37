//! Room Controller
//!
//! Stateful WebSocket signaling server for live classroom sessions.
//!
//! # Servers
//!
//! - WebSocket signaling at `GET /ws` (default: 0.0.0.0:4000)
//! - HTTP server for health and metrics endpoints (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build collaborators: platform client, SFU sidecar client, transcoder
//! 4. Connect the Redis presence mirror, if configured
//! 5. Spawn the `RoomRegistryActor`
//! 6. Start the health server, then the signaling server
//! 7. Wait for shutdown signal, drain rooms

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::secret::ExposeSecret;
use room_controller::actors::{ActorMetrics, RoomDeps, RoomRegistryActor, RoomSettings};
use room_controller::collaborators::identity::JwtIdentityVerifier;
use room_controller::collaborators::platform::PlatformClient;
use room_controller::collaborators::Collaborators;
use room_controller::config::Config;
use room_controller::media::http::HttpMediaEngine;
use room_controller::observability::{health_router, init_metrics_recorder, HealthState};
use room_controller::recording::transcoder::FfmpegTranscoder;
use room_controller::recording::{RecordingPipeline, RecordingSettings, RtpPortAllocator};
use room_controller::redis::{PresenceMirror, RedisPresenceMirror};
use room_controller::signaling::{signaling_router, SignalingContext};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time rooms get to stop recordings and flush whiteboards on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        media_engine_url = %config.media_engine_url,
        max_rooms = config.max_rooms,
        presence_mirror = config.redis_url.is_some(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Collaborators
    let platform =
        PlatformClient::new(config.platform_url.clone(), config.platform_token.clone()).map_err(
            |e| {
                error!(error = %e, "Failed to create platform client");
                e
            },
        )?;
    let collaborators = Collaborators::from_backend(Arc::new(platform));

    let engine = Arc::new(HttpMediaEngine::new(config.media_engine_url.clone()).map_err(|e| {
        error!(error = %e, "Failed to create media engine client");
        e
    })?);

    tokio::fs::create_dir_all(&config.recording_dir)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create recording directory");
            e
        })?;

    let recording = RecordingPipeline::new(
        engine.clone(),
        Arc::new(FfmpegTranscoder::new(
            config.ffmpeg_path.display().to_string(),
        )),
        collaborators.storage.clone(),
        RtpPortAllocator::new(config.recording_rtp_base_port),
        RecordingSettings {
            dir: config.recording_dir.clone(),
            listen_ip: config.recording_listen_ip.clone(),
            stop_grace: config.recording_stop_grace(),
        },
    );

    // Presence mirror is optional; a broken Redis must not block startup.
    let presence: Option<Arc<dyn PresenceMirror>> = match &config.redis_url {
        Some(url) => {
            info!("Connecting to Redis...");
            match RedisPresenceMirror::connect(url.expose_secret(), config.instance_id.clone())
                .await
            {
                Ok(mirror) => {
                    info!("Redis presence mirror connected");
                    Some(Arc::new(mirror) as Arc<dyn PresenceMirror>)
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, presence mirror disabled");
                    None
                }
            }
        }
        None => None,
    };

    // Actor system
    info!("Initializing actor system...");
    let root_token = CancellationToken::new();
    let deps = RoomDeps {
        engine,
        collaborators: collaborators.clone(),
        recording,
        presence,
        settings: RoomSettings::from_config(&config),
        metrics: ActorMetrics::new(),
    };
    let (registry, registry_task) = RoomRegistryActor::spawn(
        config.instance_id.clone(),
        deps,
        config.max_rooms,
        root_token.child_token(),
    );
    info!("Actor system initialized");

    let shutdown_token = root_token.child_token();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let identity = Arc::new(JwtIdentityVerifier::new(config.jwt_secret.clone()));
    let context = SignalingContext::new(registry.clone(), identity, collaborators.sessions);
    let signaling_app = signaling_router(context).layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("Room Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Drain rooms first so sockets receive their eviction frames.
    if let Err(e) = registry.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    shutdown_token.cancel();
    root_token.cancel();

    if tokio::time::timeout(Duration::from_secs(5), registry_task)
        .await
        .is_err()
    {
        warn!("Registry task did not exit in time");
    }

    info!("Room Controller shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
