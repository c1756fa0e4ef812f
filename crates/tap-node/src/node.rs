//! HTTP surface and startup wiring (spec §6 external interfaces, §4).
//!
//! Exposes a tap-submission endpoint backed by whichever admission front the
//! config selects, plus health/ready/metrics endpoints.
#![allow(dead_code)]

use crate::config::{AdmissionFront, NodeConfig};
use crate::TAP_NODE_VERSION;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tap_admission::{AdmissionEngine, AdmissionResult};
use tap_common::{Day, SystemTimeProvider, TapError, TimeProvider, UserId};
use tap_ledger::LedgerStore;
use tap_memtap::Aggregator;
use tap_settlement::SettlementPool;
use tap_stream::RedisEventStream;
use tracing::{error, info, warn};

static NODE_START_TIME: AtomicU64 = AtomicU64::new(0);

#[derive(clap::Parser, Debug)]
#[command(author, version = TAP_NODE_VERSION, about = "Tap ingestion node", long_about = None)]
pub struct Cli {
    #[arg(long, value_name = "PATH")]
    pub config: Option<std::path::PathBuf>,

    #[arg(long)]
    pub node_name: Option<String>,

    #[arg(long)]
    pub http_listen_addr: Option<String>,

    #[arg(long, value_enum)]
    pub front: Option<AdmissionFront>,

    #[arg(long)]
    pub redis_url: Option<String>,

    #[arg(long)]
    pub database_url: Option<String>,

    #[arg(long)]
    pub coin_per_tap: Option<i64>,

    #[arg(long)]
    pub daily_limit: Option<i64>,

    #[arg(long)]
    pub worker_count: Option<usize>,
}

/// One of the two admission fronts (spec §4.5: the aggregator is an
/// alternative front to the Redis-scripted engine, sharing the same ledger
/// contract, never both at once for a given deployment).
enum Front {
    Script {
        engine: AdmissionEngine,
        _settlement: SettlementPool,
    },
    Memtap {
        aggregator: Arc<Aggregator<dyn LedgerStore>>,
        _background: Vec<tokio::task::JoinHandle<()>>,
    },
}

#[derive(Clone)]
struct AppState {
    ledger: Arc<dyn LedgerStore>,
    front: Arc<Front>,
    cfg: Arc<NodeConfig>,
}

#[derive(Debug, Deserialize)]
struct TapRequest {
    user_id: u64,
    requested: i64,
}

#[derive(Debug, Serialize)]
struct TapResponse {
    gained: i64,
    reason: &'static str,
    energy_after: f64,
    energy_max_effective: f64,
    tapped_after: i64,
    extra_quota: i64,
    daily_remaining: i64,
}

impl From<AdmissionResult> for TapResponse {
    fn from(r: AdmissionResult) -> Self {
        TapResponse {
            gained: r.gained,
            reason: r.reason.as_str(),
            energy_after: r.energy_after,
            energy_max_effective: r.energy_max_effective,
            tapped_after: r.tapped_after,
            extra_quota: r.extra_quota,
            daily_remaining: r.daily_remaining,
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonErrorResponse {
    error: String,
}

fn tap_error_response(e: TapError) -> axum::response::Response {
    let status = if e.is_retryable() { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::BAD_REQUEST };
    (status, Json(JsonErrorResponse { error: e.to_string() })).into_response()
}

// POST /tap
async fn tap_handler(State(state): State<AppState>, Json(req): Json<TapRequest>) -> impl IntoResponse {
    let now = SystemTimeProvider.unix_seconds();
    let day = Day::from_unix_seconds(now);
    let user_id = UserId(req.user_id);

    let result = match state.front.as_ref() {
        Front::Script { engine, .. } => engine.tap(user_id, req.requested, now, &day, &state.cfg.admission_config()).await,
        Front::Memtap { aggregator, .. } => aggregator.tap(user_id, req.requested, now, &day).await,
    };

    match result {
        Ok(r) => (StatusCode::OK, Json(TapResponse::from(r))).into_response(),
        Err(e) => {
            warn!(error = %e, user_id = req.user_id, "tap request failed");
            tap_error_response(e)
        }
    }
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    balance: i64,
    taps_total: u64,
    energy: f64,
    source: &'static str,
}

// GET /users/{id}/balance — consults the aggregator snapshot first when
// present (spec §5: "Callers that need read-after-write on the ledger must
// consult the aggregator snapshot if it is present.").
async fn balance_handler(State(state): State<AppState>, AxumPath(user_id): AxumPath<u64>) -> impl IntoResponse {
    let uid = UserId(user_id);

    if let Front::Memtap { aggregator, .. } = state.front.as_ref() {
        if let Some(snap) = aggregator.snapshot(uid).await {
            return (
                StatusCode::OK,
                Json(BalanceResponse { balance: snap.balance, taps_total: snap.taps_total, energy: snap.energy, source: "aggregator_snapshot" }),
            )
                .into_response();
        }
    }

    match state.ledger.get_user(uid).await {
        Ok(Some(u)) => (
            StatusCode::OK,
            Json(BalanceResponse { balance: u.balance, taps_total: u.taps_total, energy: u.energy, source: "ledger" }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::OK,
            Json(BalanceResponse { balance: 0, taps_total: 0, energy: 0.0, source: "ledger" }),
        )
            .into_response(),
        Err(e) => tap_error_response(e),
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    uptime_seconds: u64,
    ledger: String,
}

// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let start_time = NODE_START_TIME.load(Ordering::Relaxed);
    let uptime = now.saturating_sub(start_time);

    let (status, ledger_check) = match state.ledger.get_system_state().await {
        Ok(_) => ("OK", "OK"),
        Err(e) => {
            error!(error = %e, "health check: ledger unreachable");
            ("DEGRADED", "UNREACHABLE")
        }
    };

    let code = if status == "OK" { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(HealthStatus { status: status.to_string(), timestamp: now, uptime_seconds: uptime, ledger: ledger_check.to_string() })).into_response()
}

#[derive(Debug, Serialize)]
struct ReadinessStatus {
    ready: bool,
    timestamp: u64,
}

// GET /ready
async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let ready = state.ledger.get_system_state().await.is_ok();
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(ReadinessStatus { ready, timestamp: now })).into_response()
}

// GET /metrics
async fn metrics_handler() -> impl IntoResponse {
    let mut registry = Registry::default();

    registry.register("tap_requests_total", "Admission requests observed", tap_admission::metrics::TAP_REQUESTS.clone());
    registry.register("tap_grants_total", "Admission requests granting gained > 0", tap_admission::metrics::TAP_GRANTS.clone());
    registry.register("tap_rejections_total", "Admission requests granting gained == 0", tap_admission::metrics::TAP_REJECTIONS.clone());

    registry.register("settlement_events_applied_total", "Tap events applied to the ledger", tap_settlement::metrics::EVENTS_APPLIED.clone());
    registry.register("settlement_events_poisoned_total", "Stream messages dropped as undecodable", tap_settlement::metrics::EVENTS_POISONED.clone());
    registry.register("settlement_apply_failures_total", "apply_tap_events calls that failed or fast-failed", tap_settlement::metrics::APPLY_FAILURES.clone());
    registry.register("settlement_events_reclaimed_total", "Pending entries redelivered by the reclaim loop", tap_settlement::metrics::EVENTS_RECLAIMED.clone());

    let mut buffer = String::new();
    encode(&mut buffer, &registry).unwrap();
    (StatusCode::OK, buffer)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/tap", post(tap_handler))
        .route("/users/{user_id}/balance", get(balance_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Builds the HTTP router against the memtap front and a caller-supplied
/// ledger, for tests/embedding that need the HTTP surface without a live
/// Redis connection.
pub async fn test_router_with_memtap(ledger: Arc<dyn LedgerStore>, cfg: NodeConfig) -> Router {
    let aggregator = Arc::new(Aggregator::new(
        ledger.clone(),
        cfg.admission_config(),
        std::time::Duration::from_secs(cfg.cache_ttl_secs),
        std::time::Duration::from_secs(cfg.system_refresh_secs),
    ));
    let front = Front::Memtap { aggregator, _background: Vec::new() };
    let state = AppState { ledger, front: Arc::new(front), cfg: Arc::new(cfg) };
    router(state)
}

/// Parses CLI args, loads/overrides config, builds the selected front, and
/// serves the HTTP surface until the process is signalled to stop.
pub async fn run_node() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    NODE_START_TIME.store(SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs(), Ordering::Relaxed);

    use clap::Parser;
    let cli = Cli::parse();

    let mut config = if let Some(path) = &cli.config {
        match NodeConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to load config file, using defaults");
                NodeConfig::default()
            }
        }
    } else {
        NodeConfig::default()
    };
    config.apply_cli_overrides(&cli);
    let config = Arc::new(config);

    info!(node_name = %config.node_name, front = ?config.front, "starting tap-node");

    let pg_ledger =
        Arc::new(tap_ledger::PgLedgerStore::new(&config.database_url, Arc::new(SystemTimeProvider)).await?);
    let ledger: Arc<dyn LedgerStore> = pg_ledger.clone();

    let front = match config.front {
        AdmissionFront::Script => {
            let engine = AdmissionEngine::new(&config.redis_url).await?;
            let stream = Arc::new(RedisEventStream::new(&config.redis_url).await?);
            let settlement = SettlementPool::start(stream, pg_ledger.clone(), config.settlement_config()).await?;
            Front::Script { engine, _settlement: settlement }
        }
        AdmissionFront::Memtap => {
            let aggregator = Arc::new(Aggregator::new(
                ledger.clone(),
                config.admission_config(),
                std::time::Duration::from_secs(config.cache_ttl_secs),
                std::time::Duration::from_secs(config.system_refresh_secs),
            ));
            let background = tap_memtap::spawn_background_tasks(aggregator.clone(), config.flush_config());
            Front::Memtap { aggregator, _background: background }
        }
    };

    let state = AppState { ledger, front: Arc::new(front), cfg: config.clone() };
    let app = router(state);

    let addr: std::net::SocketAddr = config.http_listen_addr.parse()?;
    info!(%addr, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
