//! # Auditrex Server
//!
//! Long-running audit-event collection and forwarding service. It pulls
//! audit events from the control-plane API on a schedule, persists them in
//! PostgreSQL, forwards unshipped events to a Splunk HEC endpoint, and
//! exposes `/health` and `/metrics` for operations.

mod config;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use prometheus::{Registry, TextEncoder};
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use auditrex_core::collector::AuditEventCollector;
use auditrex_core::database::EventDb;
use auditrex_core::database::postgres::EventStore;
use auditrex_core::fetcher::AuditEventFetcher;
use auditrex_core::informer::Informer;
use auditrex_core::metrics::{CollectorMetrics, InformerMetrics, ShipperMetrics};
use auditrex_core::shipper::SplunkShipper;
use auditrex_core::upstream::HttpControlPlaneClient;

use crate::config::Config;

/// Command line arguments for the Auditrex server
#[derive(Parser, Debug)]
#[command(name = "auditrex-server")]
#[command(about = "Audit event collection and forwarding service")]
struct Args {
    /// Ops HTTP port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    registry: Registry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let store = EventStore::new(pool);
    store.init().await.context("initialising database schema")?;
    let store: Arc<dyn EventDb> = Arc::new(store);

    let registry = Registry::new();

    let upstream =
        HttpControlPlaneClient::new(config.upstream.clone()).context("building upstream client")?;
    let fetcher = Arc::new(AuditEventFetcher::new(
        Arc::new(upstream),
        config.pagination_wait_time,
    ));

    let collector = AuditEventCollector::new(
        config.collector,
        fetcher,
        Arc::clone(&store),
        CollectorMetrics::new(&registry).context("registering collector metrics")?,
    );
    let informer = Informer::new(
        config.informer_schedule,
        Arc::clone(&store),
        InformerMetrics::new(&registry).context("registering informer metrics")?,
    );
    let shipper = match config.shipper.clone() {
        Some(shipper_config) => Some(SplunkShipper::new(
            shipper_config,
            Arc::clone(&store),
            ShipperMetrics::new(&registry).context("registering shipper metrics")?,
        )?),
        None => {
            warn!("SPLUNK_API_KEY or SPLUNK_HEC_ENDPOINT_URL not set - shipper disabled");
            None
        }
    };

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();
    let failed = Arc::new(AtomicBool::new(false));

    spawn_component(
        &tracker,
        &shutdown,
        &failed,
        "collector",
        collector.run(shutdown.clone()),
    );
    spawn_component(
        &tracker,
        &shutdown,
        &failed,
        "informer",
        informer.run(shutdown.clone()),
    );
    if let Some(shipper) = shipper {
        spawn_component(
            &tracker,
            &shutdown,
            &failed,
            "shipper",
            shipper.run(shutdown.clone()),
        );
    }

    let app = create_app(AppState {
        registry: registry.clone(),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding ops listener on {addr}"))?;
    info!(%addr, "ops http listening");
    {
        let shutdown = shutdown.clone();
        let failed = Arc::clone(&failed);
        tracker.spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned());
            if let Err(err) = serve.await {
                error!(error = %err, "ops http server failed");
                failed.store(true, Ordering::SeqCst);
                shutdown.cancel();
            }
        });
    }
    tracker.close();

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = sigterm.recv() => info!("received terminate"),
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    tracker.wait().await;

    if failed.load(Ordering::SeqCst) {
        anyhow::bail!("one or more components failed");
    }
    info!("shutdown complete");
    Ok(())
}

fn spawn_component<F>(
    tracker: &TaskTracker,
    shutdown: &CancellationToken,
    failed: &Arc<AtomicBool>,
    name: &'static str,
    task: F,
) where
    F: Future<Output = auditrex_core::Result<()>> + Send + 'static,
{
    let shutdown = shutdown.clone();
    let failed = Arc::clone(failed);
    tracker.spawn(async move {
        info!(component = name, "starting component");
        if let Err(err) = task.await {
            error!(component = name, error = %err, "component failed");
            failed.store(true, Ordering::SeqCst);
            shutdown.cancel();
        }
        info!(component = name, "component stopped");
    });
}

fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&state.registry.gather()) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(error = %err, "encoding metrics failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
