//! Randomizer Oracle
//!
//! Off-chain service that watches the RandomizerProxy contract for randomness
//! requests and fulfills them. Runs these subsystems concurrently:
//!
//! - **Listener**: websocket log subscription with keepalive, plus periodic
//!   reconciliation over JSON-RPC to recover missed requests.
//! - **Fulfiller**: drains the request queue in bounded concurrent batches.
//! - **Gas governor**: keeps the contract's gas price estimate current.
//! - **HTTP server**: liveness (`/health`) and status (`/status`) probes.

use actix_web::{App, HttpResponse, HttpServer, web};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

mod chain;
mod config;
mod contract;
mod dedup;
mod fulfiller;
mod gas;
mod listener;
mod metrics;
mod queue;
mod randomness;
mod scheduler;
#[cfg(test)]
mod testing;

use chain::{AlloyChain, WsEventSource};
use config::AppConfig;
use metrics::Metrics;
use scheduler::{Oracle, Schedule};

const DEFAULT_LOG_FILTER: &str =
    "info,alloy_transport=warn,alloy_pubsub=warn,hyper=warn,reqwest=warn";

type LiveOracle = Oracle<AlloyChain, WsEventSource>;

/// Shared application state accessible from HTTP handlers.
struct AppState {
    oracle: Arc<LiveOracle>,
}

/// Liveness probe. Returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Status probe: connection state, queue depth and pipeline counters.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "oracle": data.oracle.status(),
        "metrics": data.oracle.metrics().to_json(),
    }))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env()?;

    info!(
        contract = %config.contract_address,
        operator = %config.operator_signer.address(),
        "Starting randomizer oracle"
    );
    info!(rpc = %config.rpc_url, ws = %config.ws_url, "Endpoints configured");
    info!(
        blocks_per_minute = config.blocks_per_minute,
        initial_lookback_minutes = config.initial_lookback_minutes,
        recurring_lookback_minutes = config.recurring_lookback_minutes,
        concurrency = config.fulfillment_concurrency,
        "Pipeline configured"
    );

    let chain = Arc::new(AlloyChain::new(&config)?);
    let connector = WsEventSource::new(config.ws_url.clone(), config.contract_address);
    let oracle = Arc::new(Oracle::new(
        chain,
        connector,
        Arc::new(Metrics::new()),
        config.blocks_per_minute,
        config.fulfillment_concurrency,
        Schedule::from_config(&config),
    ));

    let cancel = CancellationToken::new();
    let pipeline = tokio::spawn(oracle.clone().run(cancel.clone()));

    let state = web::Data::new(AppState { oracle });
    let addr = ("0.0.0.0", config.http_port);
    info!(port = config.http_port, "Starting HTTP server");

    // Returns once the server stops, which it does on SIGINT/SIGTERM.
    let served = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
    })
    .bind(addr)?
    .run()
    .await;

    info!("HTTP server stopped, shutting down");
    cancel.cancel();
    match pipeline.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %format!("{e:#}"), "Oracle pipeline failed"),
        Err(e) => error!(error = %e, "Oracle pipeline task aborted"),
    }

    served?;
    Ok(())
}
