use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initializes logging with a daily-rolling file under `logs_dir` and, when
/// `console` is set, a compact stderr layer.
///
/// `RUST_LOG` overrides `default_filter`. Returns a guard that must be kept
/// alive for the duration of the process so buffered lines get flushed.
pub fn init_logging(
    logs_dir: &Path,
    file_prefix: &str,
    default_filter: &str,
    console: bool,
) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(non_blocking);

    let console_layer = console.then(|| {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_writer(std::io::stderr)
            .compact()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    tracing::debug!("Logging to {}", logs_dir.display());
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber can be installed per process, so the
        // result may be an error; the directory must exist either way.
        let result = init_logging(&logs_dir, "shoal-test", "warn", false);
        assert!(logs_dir.exists());

        match result {
            Ok(guard) => drop(guard),
            Err(e) => {
                let msg = e.to_string();
                assert!(
                    msg.contains("logging") || msg.contains("subscriber"),
                    "unexpected error: {msg}"
                );
            }
        }
    }

    #[test]
    fn test_env_filter_fallback() {
        let filters = ["info", "debug", "shoal_network=debug,warn"];
        for f in &filters {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(f));
            drop(filter);
        }
    }
}
