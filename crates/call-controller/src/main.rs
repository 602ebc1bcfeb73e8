//! Call Controller binary.
//!
//! Hosts a [`CallControllerHandle`] over the in-process media engine and the
//! in-memory record store, next to an HTTP listener for `/health`, `/ready`
//! and `/metrics` (default `0.0.0.0:8082`). A signaling gateway embedding the
//! library feeds the handle `SignalingEvent`s directly.
//!
//! Startup order matters: configuration decides the log filter, and the
//! Prometheus recorder has to be installed before the first metric is touched.
//! On SIGTERM or Ctrl+C readiness flips off first, then live calls are ended
//! with reason `shutdown` and their records flushed.

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use call_controller::actors::{ActorMetrics, CallControllerHandle};
use call_controller::config::Config;
use call_controller::media::{InProcessEngine, MediaEngine, RouterRegistry};
use call_controller::observability::{health_router, init_metrics_recorder, HealthState};
use call_controller::store::{CallRecordStore, InMemoryCallRecordStore};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Time live calls get to end and persist their records on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env().inspect_err(|e| {
        eprintln!("call-controller: invalid configuration: {e}");
    })?;
    init_tracing(&config);

    info!(
        target: "cc.main",
        controller_id = %config.controller_id,
        health_bind_address = %config.health_bind_address,
        workers = config.worker_pool_size,
        max_routers_per_worker = config.max_routers_per_worker,
        worker_retry_seconds = config.worker_retry_seconds,
        rtc_ports = %format!("{}-{}", config.rtc_min_port, config.rtc_max_port),
        ring_timeout_seconds = config.ring_timeout_seconds,
        max_active_calls = config.max_active_calls,
        "Call controller starting"
    );

    let prometheus = init_metrics_recorder().inspect_err(|e| {
        error!(target: "cc.main", error = %e, "Prometheus recorder install failed");
    })?;

    let engine: Arc<dyn MediaEngine> = Arc::new(InProcessEngine::from_config(&config));
    let registry = Arc::new(RouterRegistry::from_config(engine, &config));
    let store: Arc<dyn CallRecordStore> = Arc::new(InMemoryCallRecordStore::new());
    let controller = CallControllerHandle::new(&config, registry, store, ActorMetrics::new());

    // Bind before spawning so a taken port fails startup
    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .map_err(|e| format!("bad CALL_HEALTH_BIND_ADDRESS {}: {e}", config.health_bind_address))?;
    let listener = TcpListener::bind(health_addr)
        .await
        .map_err(|e| format!("cannot bind health listener on {health_addr}: {e}"))?;

    let health = Arc::new(HealthState::new());
    let app = health_router(Arc::clone(&health), Some(prometheus));
    let stop_http = CancellationToken::new();
    let http_task = {
        let stop = stop_http.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(target: "cc.main", error = %e, "Health listener failed");
            }
        })
    };

    health.set_ready();
    info!(target: "cc.main", addr = %health_addr, "Call controller ready");

    if let Err(e) = wait_for_signal().await {
        error!(target: "cc.main", error = %e, "Signal handling unavailable, shutting down");
    }

    info!(target: "cc.main", "Draining calls");
    health.set_draining();
    if let Err(e) = controller.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(target: "cc.main", error = %e, "Controller shutdown incomplete");
    }

    stop_http.cancel();
    if let Err(e) = http_task.await {
        warn!(target: "cc.main", error = %e, "Health listener task failed");
    }

    info!(target: "cc.main", "Call controller stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.observability.log_level)
        .unwrap_or_else(|_| EnvFilter::new("call_controller=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolve on Ctrl+C or, on unix, SIGTERM.
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
