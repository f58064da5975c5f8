use std::sync::Arc;

use anyhow::{Context, Result};
use ensemble_core::{AgentVariant, EnsembleError, EnsembleState};
use ensemble_engine::{AuditWriter, EnsembleOrchestrator};
use stock_env::{BaselineAgentFactory, StockEnvFactory};

mod config;
mod data;

use config::RunnerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting ensemble walk-forward runner");

    // 2. Load configuration
    let config = RunnerConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Data file: {}", config.data_file.display());
    tracing::info!(
        "  Trade calendar: ({}, {}]",
        config.trade_calendar_start,
        config.trade_calendar_end
    );
    tracing::info!(
        "  Rebalance window: {} | Validation window: {}",
        config.rebalance_window,
        config.validation_window
    );
    tracing::info!("  Turbulence gating: {}", config.use_turbulence);
    tracing::info!("  Initial capital: ${}", config.initial_capital);
    for (variant, steps) in &config.timesteps {
        tracing::info!("  {variant}: {steps} timesteps");
    }

    // 3. Load market data
    let dataset = data::load_dataset(&config.data_file)?;
    let calendar =
        dataset.trade_calendar(Some(config.trade_calendar_start), Some(config.trade_calendar_end));
    tracing::info!(
        "Dataset: {} dates x {} instruments, {} trade dates",
        dataset.len(),
        dataset.stock_dimension(),
        calendar.len()
    );

    // 4. Build the orchestrator
    let ensemble_config = config.ensemble_config();
    let variants: Vec<AgentVariant> = ensemble_config.variants.iter().map(|s| s.variant).collect();
    let orchestrator = EnsembleOrchestrator::new(
        ensemble_config,
        Arc::new(BaselineAgentFactory::new(config.stock_dimension, config.agent_seed)),
        Arc::new(StockEnvFactory),
    )
    .context("failed to build ensemble orchestrator")?;
    let cancel = orchestrator.cancellation_token();

    // 5. Run on a blocking thread; Ctrl-C stops at the next window boundary
    let run = tokio::task::spawn_blocking(move || {
        let mut state = EnsembleState::new();
        let result = orchestrator.run(&dataset, &calendar, &mut state);
        (state, result)
    });
    tokio::pin!(run);

    let (state, result) = tokio::select! {
        joined = &mut run => joined.context("ensemble run panicked")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Received SIGINT, stopping after the current window");
            cancel.cancel();
            run.await.context("ensemble run panicked")?
        }
    };

    // 6. Persist what was committed, even on failure
    let audit = AuditWriter::new(&config.results_dir)
        .with_context(|| format!("failed to create {}", config.results_dir.display()))?;
    audit
        .write_state(&state, &variants)
        .context("failed to write ensemble state")?;

    for (variant, count) in state.usage_counts() {
        tracing::info!("  {variant}: selected for {count} windows");
    }

    match result {
        Ok(summary) => {
            let path = audit.dir().join("run_summary.json");
            std::fs::write(&path, serde_json::to_string_pretty(&summary)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
            for skipped in &summary.skipped {
                tracing::warn!(
                    "Window {} skipped during {}: {}",
                    skipped.window,
                    skipped.stage,
                    skipped.reason
                );
            }
            tracing::info!(
                "Ensemble run finished: {}/{} windows in {:.2} minutes",
                summary.windows_completed,
                summary.windows_scheduled,
                summary.elapsed_minutes
            );
            Ok(())
        }
        Err(e @ EnsembleError::Cancelled { .. }) => {
            tracing::warn!(
                "Run cancelled after {} committed windows",
                state.windows_completed()
            );
            Err(e.into())
        }
        Err(e) => Err(anyhow::Error::new(e).context("ensemble run failed")),
    }
}
