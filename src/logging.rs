use std::path::Path;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for one process.
///
/// The agent and its worker subcommands log JSON to stdout: worker failures
/// are diagnosed by reading the container's log stream back and picking out
/// the first `level=error` line, so the stdout format is part of the worker
/// contract. The launcher logs human-readable text instead.
pub fn init_logging(log_dir: &str, instance: &str, debug: bool, json: bool) {
    let _ = rotate_logs_on_startup(log_dir, instance);
    let _ = std::fs::create_dir_all(log_dir);

    let file_appender = rolling::daily(log_dir, format!("{instance}.log"));
    let (non_blocking_file, guard) = non_blocking(file_appender);

    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    if json {
        let stdout_layer = fmt::layer().json().with_ansi(false).with_target(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stdout_layer)
            .init();
    } else {
        let stdout_layer = fmt::layer().with_target(false);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stdout_layer)
            .init();
    }

    // Keep the appender guard alive for the whole process.
    std::mem::forget(guard);
}

fn rotate_logs_on_startup(log_dir: &str, instance: &str) -> std::io::Result<()> {
    let log_file = format!("{log_dir}/{instance}.log");
    let log_path = Path::new(&log_file);

    if log_path.exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_file = format!("{log_dir}/{instance}.{timestamp}.log");
        std::fs::rename(&log_file, &backup_file)?;
    }

    Ok(())
}
