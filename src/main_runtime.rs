use panther::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Console logging plus a daily-rolling file when the log directory is
/// writable. The returned guard must live until exit so buffered lines are
/// flushed.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let log_dir = std::env::var("PANTHER_LOG_DIR")
        .ok()
        .map(std::path::PathBuf::from)
        .or_else(|| config.dir.clone());

    // `rolling::daily` aborts if it cannot create the first file, so probe first
    let (file_layer, guard) = match log_dir.as_deref().filter(|dir| writable(dir)) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "panther.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => {
            if let Some(dir) = &log_dir {
                eprintln!(
                    "Warning: log directory {} is not writable, file logging disabled",
                    dir.display()
                );
            }
            (None, None)
        }
    };

    let (json_layer, text_layer) = if config.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();

    if let Some(dir) = log_dir.filter(|_| guard.is_some()) {
        eprintln!("Logging to: {}/panther.log", dir.display());
    }
    guard
}

fn writable(dir: &std::path::Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".panther_write_test");
    match std::fs::OpenOptions::new().create(true).append(true).open(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Minimal logging for the client subcommands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
