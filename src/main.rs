// =============================================================================
// Perp Movers Bot -- Main Entry Point
// =============================================================================
//
// Runs the movers-scanning pipeline (C1-C7) and the trading strategy engine
// (C8-C9) on a shared cycle. Trading is only active when exchange
// credentials are present in the environment; otherwise the bot runs in
// scan-only mode and still serves the read-only HTTP surface.
// =============================================================================

mod api;
mod config;
mod exchange;
mod executor;
mod fuser;
mod liquidity;
mod metrics;
mod movers;
mod notifier;
mod strategy;
mod types;
mod universe;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::executor::Executor;
use crate::movers::MoversPipeline;
use crate::notifier::Notifier;
use crate::strategy::StrategyEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("perp-movers-bot starting up");

    let config = Config::from_env();
    let trading_enabled = config.trading_enabled();
    info!(
        trading_enabled,
        leverage = config.leverage,
        refresh_interval_minutes = config.refresh_interval_minutes,
        http_port = config.http_port,
        "configuration loaded"
    );

    let client = ExchangeClient::new(
        config.exchange_api_key.clone(),
        config.exchange_api_secret.clone(),
        config.recv_window_ms,
    );

    let pipeline = MoversPipeline::new();
    let executor = Arc::new(Executor::new(client, config.leverage));
    let notifier = Arc::new(Notifier::new(
        config.telegram_token.clone(),
        config.telegram_chat_id.clone(),
    ));
    let strategy = Arc::new(StrategyEngine::new(
        executor.clone(),
        Some(notifier),
        config.ksl_buffer,
    ));

    if trading_enabled {
        if let Err(e) = executor.initialize().await {
            error!(error = %e, "executor initialization failed, trading may be degraded");
        }
    } else {
        warn!("no exchange credentials configured, running in scan-only mode");
    }

    // ── HTTP surface ──────────────────────────────────────────────────────
    let api_state = Arc::new(ApiState::new());
    {
        let api_state = api_state.clone();
        let bind_addr = format!("0.0.0.0:{}", config.http_port);
        tokio::spawn(async move {
            let app = api::router(api_state);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "failed to bind HTTP server");
                    return;
                }
            };
            info!(addr = %bind_addr, "HTTP server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "HTTP server failed");
            }
        });
    }

    // ── Cycle loop ────────────────────────────────────────────────────────
    // Cycles are single-flight: if a cycle is still running when the next
    // tick fires, the tick is dropped rather than overlapping the next run.
    let cycle_client = ExchangeClient::new(
        config.exchange_api_key.clone(),
        config.exchange_api_secret.clone(),
        config.recv_window_ms,
    );
    let running = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let cycle_handle = {
        let running = running.clone();
        let shutdown = shutdown.clone();
        let interval_secs = (config.refresh_interval_minutes * 60).max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.notified() => break,
                }

                if running.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    warn!("previous cycle still running, skipping this tick");
                    continue;
                }

                let result = pipeline.run_cycle(&cycle_client).await;
                info!(
                    symbols = result.snapshots.len(),
                    top = result.aggregated_top.len(),
                    "movers cycle complete"
                );
                api_state.publish(result.clone());

                strategy.run_cycle(&result).await;

                running.store(false, std::sync::atomic::Ordering::SeqCst);
            }
        })
    };

    info!("perp-movers-bot running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, waiting for in-flight cycle to finish");
    shutdown.notify_one();
    let _ = cycle_handle.await;

    info!("perp-movers-bot shut down complete");
    Ok(())
}
