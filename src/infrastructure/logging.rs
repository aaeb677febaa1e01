use crate::domain::settings::{LogFileSettings, LogRotation, LogSettings};
use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the non-blocking file writer flushing until dropped.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse_lossy(&settings.level)
    });
    let verbose = settings.verbose_records;

    let console_layer = settings.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_file(verbose)
            .with_line_number(verbose)
            .with_thread_ids(verbose)
    });

    let (file_layer, guard) = match &settings.file {
        Some(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(file)?);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(verbose)
                .with_line_number(verbose)
                .with_thread_ids(verbose);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Logging initialized (console: {}, file: {})",
        settings.console,
        settings.file.is_some()
    );
    Ok(LoggingGuard { _file: guard })
}

fn file_appender(file: &LogFileSettings) -> anyhow::Result<RollingFileAppender> {
    let dir = file.resolved_dir()?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Could not create log directory {}", dir.display()))?;
    Ok(RollingFileAppender::new(rotation(file.rotation), dir, &file.prefix))
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_follows_setting() {
        assert_eq!(rotation(LogRotation::Hourly), Rotation::HOURLY);
        assert_eq!(rotation(LogRotation::Never), Rotation::NEVER);
        assert_eq!(rotation(LogRotation::default()), Rotation::DAILY);
    }

    #[test]
    fn file_appender_creates_missing_directory() {
        let dir = std::env::temp_dir().join(format!("ble_coordinator_logs_{}", std::process::id()));
        let file = LogFileSettings {
            dir: Some(dir.clone()),
            prefix: "test.log".to_string(),
            rotation: LogRotation::Never,
        };
        file_appender(&file).unwrap();
        assert!(dir.is_dir());
        let _ = std::fs::remove_dir_all(dir);
    }
}
