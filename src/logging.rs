use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber writing to `logs/pinpoint.log`.
///
/// The TUI owns the terminal, so the file is the only sink unless
/// `to_stderr` is set (headless `serve` mode). Keep the returned guard
/// alive for the whole process or buffered lines are lost.
pub fn initialize_logging(to_stderr: bool) -> WorkerGuard {
    // Create 'logs' directory if it doesn't exist
    let _ = std::fs::create_dir_all("logs");

    let file_appender = tracing_appender::rolling::daily("logs", "pinpoint.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = to_stderr.then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(stderr_layer)
        .init();

    tracing::info!("Logging initialized successfully.");
    guard
}
