use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use drawdiff::config::loader::validate_config;
use drawdiff::config::{load_config, Config};
use drawdiff::pipeline::TaskOutcome;
use drawdiff::telemetry::init_logging;
use drawdiff::{Database, DrawdiffError, StageRunner, WorkerError, WorkerPool};

const CONFIG_ENV: &str = "DRAWDIFF_CONFIG";

fn main() {
    if let Err(e) = run() {
        eprintln!("drawdiff-worker: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), DrawdiffError> {
    let config = resolve_config()?;
    init_logging(&config.logging)?;

    info!(
        "Starting drawdiff worker (database: {}, storage: {})",
        config.database_path, config.storage_root
    );

    let db = Database::open(Path::new(&config.database_path))?;
    let runner = Arc::new(StageRunner::from_config(&config, db));
    let pool = WorkerPool::new(
        runner,
        config.worker_count,
        config.worker.stage_kinds.clone(),
        Duration::from_millis(config.worker.poll_interval_ms),
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || stop_flag.store(true, Ordering::Relaxed))
        .map_err(|e| WorkerError::Signal(e.to_string()))?;

    while !stop.load(Ordering::Relaxed) {
        let Some(report) = pool.recv_report_timeout(Duration::from_millis(250)) else {
            continue;
        };
        match report.outcome {
            Ok(TaskOutcome::Completed { result_ref }) => {
                info!("{} finished {} task: {}", report.worker_id, report.kind, result_ref)
            }
            Ok(TaskOutcome::Failed { error }) => {
                warn!("{} task failed terminally: {}", report.kind, error)
            }
            Ok(outcome) => log::debug!("{}: {:?}", report.worker_id, outcome),
            Err(e) => error!("{} could not process {} task: {}", report.worker_id, report.kind, e),
        }
    }

    pool.shutdown();
    pool.wait();
    info!("drawdiff worker stopped");
    Ok(())
}

/// Config file from the first argument or `DRAWDIFF_CONFIG`; built-in
/// defaults otherwise.
fn resolve_config() -> Result<Config, DrawdiffError> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    match path {
        Some(path) => Ok(load_config(&path)?),
        None => {
            let config = Config::default();
            validate_config(&config)?;
            Ok(config)
        }
    }
}
