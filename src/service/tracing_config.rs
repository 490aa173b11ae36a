use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::AppResult;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Console-only subscriber for tests and tools. Calling it again once a
/// subscriber is installed is a no-op.
pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true);
    // several test modules share one process
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .try_init();
    Ok(())
}

/// Hourly rolling file under `logs/` plus stderr. `verbose` raises the
/// default level when `RUST_LOG` is not set. Keep the guard alive for the
/// lifetime of the process or buffered lines are lost.
pub fn setup_tracing(verbose: u8) -> AppResult<WorkerGuard> {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::hourly("logs", "netlogger.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    // netstring entries go to stdout when no output file is configured,
    // diagnostics go to stderr then
    let writer = non_blocking.and(std::io::stderr);

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer);

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| super::AppError::IllegalStateError(format!("tracing already set up: {}", e)))?;
    Ok(worker_guard)
}
