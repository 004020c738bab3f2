//! Tracing setup for the driver binary.

use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "emotion-forecast.log";

/// Where and how much to log; resolved by [`crate::config::Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directives, e.g. `info` or `emotion_forecast::train=debug`
    pub filter: String,
    /// Directory for the daily-rolling log file; stdout only when `None`
    pub file_dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            file_dir: None,
        }
    }
}

/// Keeps the background file writer alive; drop it last.
pub struct FileLogGuard {
    _guard: WorkerGuard,
    dir: PathBuf,
}

impl FileLogGuard {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Non-blocking writer over a daily-rolling file in `dir`, creating it first.
fn rolling_writer(dir: &Path) -> io::Result<(NonBlocking, FileLogGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((
        writer,
        FileLogGuard {
            _guard: guard,
            dir: dir.to_path_buf(),
        },
    ))
}

/// Installs the global subscriber: stdout always, plus the rolling file when
/// `settings.file_dir` is set and usable. Problems with either setting are
/// reported through the installed subscriber instead of aborting.
pub fn init_tracing(settings: &LogSettings) -> Option<FileLogGuard> {
    let (env_filter, bad_filter) = match EnvFilter::try_new(&settings.filter) {
        Ok(filter) => (filter, None),
        Err(err) => (EnvFilter::new("info"), Some(err)),
    };

    let (file, file_error) = match settings.file_dir.as_deref().map(rolling_writer) {
        Some(Ok(pair)) => (Some(pair), None),
        Some(Err(err)) => (None, Some(err)),
        None => (None, None),
    };
    let (file_layer, guard) = match file {
        Some((writer, guard)) => (
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true),
            ),
            Some(guard),
        ),
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init();
    if let Err(err) = installed {
        eprintln!("tracing subscriber already installed: {err}");
    }

    if let Some(err) = bad_filter {
        tracing::warn!(filter = %settings.filter, error = %err, "invalid log filter, using info");
    }
    if let (Some(dir), Some(err)) = (&settings.file_dir, file_error) {
        tracing::warn!(dir = %dir.display(), error = %err, "file logging disabled");
    }
    if let Some(guard) = &guard {
        tracing::debug!(dir = %guard.dir().display(), "file logging enabled");
    }
    guard
}
