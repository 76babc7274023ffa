use once_cell::sync::OnceCell;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

/// Environment variable holding an `EnvFilter` directive that overrides the
/// level passed to [`init_tracing`].
pub const LOG_ENV: &str = "MEDIA_WATCH_LOG";

static LOG_GUARD: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Installs the global subscriber, writing to `log_file` through a
/// non-blocking appender or to stderr. Returns `Ok(false)` if logging was
/// already initialized.
pub fn init_tracing(log_file: Option<&Path>, default_level: &str) -> Result<bool> {
    let mut installed = false;
    LOG_GUARD.get_or_try_init(|| {
        let guard = install_subscriber(log_file, default_level)?;
        installed = true;
        Ok::<_, Error>(guard)
    })?;

    if installed {
        tracing::info!("Logging initialized");
    }
    Ok(installed)
}

fn install_subscriber(log_file: Option<&Path>, default_level: &str) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let file_name = path.file_name().ok_or_else(|| {
                Error::Tracing(format!("Invalid log file path: {}", path.display()))
            })?;
            let directory = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(directory).map_err(|e| Error::Tracing(e.to_string()))?;

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| Error::Tracing(e.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| Error::Tracing(e.to_string()))?;
            Ok(None)
        }
    }
}
