//! vg-daemon entry point.
//!
//! Loads config, resolves secrets, picks storage, builds the shared state,
//! wires middleware and serves until Ctrl-C.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};
use vg_audit::AuditSink;
use vg_config::{
    load_layered_yaml, report_unused_keys, secrets::resolve_secrets, ConfigSurface, UnusedKeyPolicy,
};
use vg_daemon::{routes, state};
use vg_gate::{MemoryStore, SystemClock};

const DEFAULT_CONFIG: &str = "config/base.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let paths = config_paths_from_env();
    let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = load_layered_yaml(&path_refs).context("load config")?;
    let report = report_unused_keys(ConfigSurface::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        warn!(unused = ?report.unused_leaf_pointers, "config contains keys nothing reads");
    }
    info!(config_hash = %loaded.config_hash, layers = ?paths, "config loaded");

    let secrets = resolve_secrets(&loaded.config_json)?;
    let parts = state::gate_parts_from_config(&loaded.config_json, &secrets)?;
    info!(stages = parts.registry.len(), "stage registry loaded");

    let (store, db_audit): (state::DaemonStore, Option<Arc<dyn AuditSink>>) =
        match std::env::var(vg_db::ENV_DB_URL) {
            Ok(url) => {
                let pool = vg_db::connect(&url).await?;
                vg_db::migrate(&pool).await?;
                let pg = vg_db::PgGateStore::new(pool);
                let audit: Arc<dyn AuditSink> = Arc::new(pg.clone());
                (state::DaemonStore::Postgres(pg), Some(audit))
            }
            Err(_) => {
                warn!("{} not set; sessions are in-memory and lost on restart", vg_db::ENV_DB_URL);
                (state::DaemonStore::Memory(MemoryStore::new()), None)
            }
        };
    info!(store = store.kind(), "gate store selected");
    let audit = state::audit_sink_from_config(&loaded.config_json, db_audit)?;
    let sweep_every = state::sweep_interval_from_config(&loaded.config_json)?;

    let shared = Arc::new(
        state::AppState::new(parts, store, audit, Arc::new(SystemClock::new()))
            .with_config_hash(loaded.config_hash.clone()),
    );

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_expiry_sweep(Arc::clone(&shared), sweep_every);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("vg-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    info!("vg-daemon stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// `VG_CONFIG` is a comma-separated list of layers, base first.
fn config_paths_from_env() -> Vec<String> {
    match std::env::var("VG_CONFIG") {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect(),
        _ => vec![DEFAULT_CONFIG.to_string()],
    }
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("VG_DAEMON_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl_c handler failed; shutting down");
    }
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
