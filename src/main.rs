use anyhow::{bail, Context};
use metric_engine_lib::config::load_metric_batch;
use metric_engine_lib::{init_tracing, EngineConfig, MetricEngine, RunMode, RunStatus, SqliteValueStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const USAGE: &str = "usage: metric-engine <config.yaml> <metrics.yaml> [--rehearsal]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut positional = Vec::new();
    let mut mode = RunMode::Live;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--rehearsal" => mode = RunMode::Rehearsal,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(());
            }
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    let [config_path, metrics_path] = positional.as_slice() else {
        bail!(USAGE);
    };

    let config = EngineConfig::load(config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("logs"));
    if let Err(error) = init_tracing(&log_dir) {
        eprintln!("logging disabled: {error}");
    }

    let metrics = load_metric_batch(metrics_path)
        .with_context(|| format!("loading metrics {}", metrics_path.display()))?;
    let store = Arc::new(
        SqliteValueStore::new(&config.store.path)
            .with_context(|| format!("opening value store {}", config.store.path.display()))?,
    );

    let engine = MetricEngine::new(config.connectors(), store.clone(), config.engine_options());
    let accepted = engine.run(&metrics, mode).await.context("starting metric run")?;
    tracing::info!(run_id = %accepted.run_id, total = accepted.total, "batch started");

    let stopper = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("stopping after the current metric...");
            let _ = stopper.stop();
        }
    });

    let mut announced = 0usize;
    let state = loop {
        let state = engine.get_state();
        for result in state.results.iter().skip(announced) {
            eprintln!(
                "[{}/{}] {} = {} ({})",
                announced + 1,
                state.total,
                result.metric_id,
                result.value,
                result.source.as_str()
            );
            announced += 1;
        }
        if !state.is_running() {
            break state;
        }
        sleep(POLL_INTERVAL).await;
    };

    engine.shutdown();
    match store.prune_history(config.store.history_retention_days) {
        Ok(pruned) if pruned > 0 => tracing::info!(pruned, "pruned metric value history"),
        Ok(_) => {}
        Err(error) => tracing::warn!(error = %error, "history prune failed"),
    }

    println!("{}", serde_json::to_string_pretty(&state)?);
    if state.status == RunStatus::Error {
        bail!(
            "metric run failed: {}",
            state.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
