//! Tracing setup shared by the CLI and the trigger server.

use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "sanctions_watch=info";
const LOG_FILE_PREFIX: &str = "sanctions_watch.log";

/// Flush guard of the file writer; held until the process exits
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Directory for the rolling JSON log, `WATCH_LOG_DIR` or `logs`
pub fn log_dir() -> PathBuf {
    std::env::var_os("WATCH_LOG_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs"))
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber: daily-rolled JSON lines under [`log_dir`] and a
/// compact stream on stderr, leaving stdout to the CLI summaries.
///
/// Calling it again is a no-op. An unusable log directory downgrades to stderr only.
pub fn init_logging() {
    if FILE_GUARD.get().is_some() {
        return;
    }

    let dir = log_dir();
    let file_layer = match std::fs::create_dir_all(&dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(writer),
            )
        }
        Err(e) => {
            eprintln!("log directory {} is unusable ({e}); logging to stderr only", dir.display());
            None
        }
    };
    let console_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(file_layer)
        .with(console_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn repeated_init_uses_the_configured_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("watch-logs");
        std::env::set_var("WATCH_LOG_DIR", &target);
        assert_eq!(log_dir(), target);

        init_logging();
        init_logging();
        assert!(target.is_dir());
        std::env::remove_var("WATCH_LOG_DIR");
    }
}
