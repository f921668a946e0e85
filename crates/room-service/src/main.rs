//! Room Service
//!
//! Real-time meeting room coordinator.
//!
//! # Servers
//!
//! - HTTP server for the lifecycle API and WebSocket signaling (default: 0.0.0.0:8080)
//! - HTTP server for health and metrics endpoints (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the meeting store and event bus (Redis, or in-process)
//! 4. Start the media engine and the room registry
//! 5. Start health server (liveness, readiness, metrics)
//! 6. Start API/signaling server
//! 7. Wait for shutdown signal, drain, stop rooms

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use axum::Router;
use common::secret::ExposeSecret;
use room_service::actors::RoomRegistry;
use room_service::auth::IdentityResolver;
use room_service::bus::redis::RedisEventBus;
use room_service::bus::{EventBus, LocalEventBus};
use room_service::config::Config;
use room_service::media::{default_media_codecs, LoopbackEngine, MediaEngine};
use room_service::meetings::{
    InMemoryMeetingStore, MeetingLifecycle, MeetingStore, RedisMeetingStore, WaitingRoom,
};
use room_service::observability::{health_router, init_metrics_recorder, HealthState};
use room_service::routes::{build_routes, AppState};
use room_service::signaling::SignalingContext;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often finished room actors are reaped.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Poll interval while draining rooms on shutdown.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Time given to room actors to stop after the drain period.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first: it decides the log format
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "room_service=debug,tower_http=debug".into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Room Service");
    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        redis = config.redis_url.is_some(),
        engine_timeout_ms = config.engine_timeout.as_millis(),
        max_message_bytes = config.max_message_bytes,
        outbound_buffer = config.outbound_buffer,
        allow_guests = config.allow_guests,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow!(e)
    })?;
    info!("Prometheus metrics recorder initialized");

    // Meeting store and event bus
    let (store, bus): (Arc<dyn MeetingStore>, Arc<dyn EventBus>) = match &config.redis_url {
        Some(url) => {
            info!("Connecting to Redis...");
            let store = RedisMeetingStore::connect(url.expose_secret())
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to connect meeting store to Redis");
                    e
                })?;
            let bus = RedisEventBus::connect(url.expose_secret())
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to connect event bus to Redis");
                    e
                })?;
            info!("Redis connection established");
            (Arc::new(store), Arc::new(bus))
        }
        None => {
            warn!("REDIS_URL not set, using in-memory meeting store and in-process event bus");
            (
                Arc::new(InMemoryMeetingStore::new()),
                Arc::new(LocalEventBus::new()),
            )
        }
    };

    // Media engine and rooms
    let shutdown_token = CancellationToken::new();
    let engine: Arc<dyn MediaEngine> = Arc::new(LoopbackEngine::new());
    let registry = Arc::new(RoomRegistry::new(
        Arc::clone(&engine),
        default_media_codecs(),
        config.engine_timeout,
        shutdown_token.child_token(),
    ));

    let waiting_room = Arc::new(WaitingRoom::new(Arc::clone(&store), Arc::clone(&bus)));
    let lifecycle = Arc::new(MeetingLifecycle::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::clone(&waiting_room),
    ));

    let signaling = SignalingContext {
        identity: Arc::new(IdentityResolver::new(&config.jwt_secret, config.allow_guests)),
        store,
        bus,
        registry: Arc::clone(&registry),
        lifecycle,
        waiting_room,
        engine_timeout: config.engine_timeout,
        shutdown: shutdown_token.clone(),
    };

    // Health state: ready while the engine is up and rooms are accepted
    let probe_registry = Arc::clone(&registry);
    let health_state = Arc::new(
        HealthState::new().with_readiness_probe(move || {
            probe_registry.engine_available() && probe_registry.is_accepting()
        }),
    );

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        anyhow!("Invalid health bind address: {e}")
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
            anyhow!("Failed to bind health server to {health_addr}: {e}")
        })?;

    // Health keeps serving through the drain; it stops with the process
    let health_stop = CancellationToken::new();
    let health_stop_signal = health_stop.clone();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_stop_signal.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start API and signaling server
    let api_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        anyhow!("Invalid bind address: {e}")
    })?;
    let api_listener = tokio::net::TcpListener::bind(api_addr).await.map_err(|e| {
        error!(error = %e, addr = %api_addr, "Failed to bind API server");
        anyhow!("Failed to bind API server to {api_addr}: {e}")
    })?;

    let shutdown_grace = config.shutdown_grace;
    let app = build_routes(Arc::new(AppState { config, signaling }));
    let api_shutdown = shutdown_token.clone();
    let api_task = tokio::spawn(async move {
        info!(addr = %api_addr, "API server starting");
        let server = axum::serve(api_listener, app).with_graceful_shutdown(async move {
            api_shutdown.cancelled().await;
            info!("API server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "API server failed");
        }
    });

    // Periodically drop bookkeeping for rooms that have stopped
    let reap_registry = Arc::clone(&registry);
    let reap_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = reap_token.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = reap_registry.reap_finished();
                    if reaped > 0 {
                        info!(reaped, "Reaped finished rooms");
                    }
                }
            }
        }
    });

    health_state.set_ready();
    info!("Room Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    // Mark as not ready immediately so the load balancer stops sending traffic
    info!("Shutdown signal received, draining rooms...");
    health_state.set_not_ready();
    registry.set_draining();

    // Let live rooms empty out for up to the grace period
    let drain_deadline = tokio::time::Instant::now() + shutdown_grace;
    while registry.room_count() > 0 && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
    let remaining = registry.room_count();
    if remaining > 0 {
        warn!(rooms = remaining, "Drain period elapsed with live rooms");
    }

    // Remaining connections receive `meeting-ended` and disconnect
    shutdown_token.cancel();
    registry.shutdown(ROOM_STOP_TIMEOUT).await;

    if let Err(e) = api_task.await {
        warn!(error = %e, "API server task failed");
    }
    health_stop.cancel();
    if let Err(e) = health_task.await {
        warn!(error = %e, "Health server task failed");
    }

    info!("Room Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
