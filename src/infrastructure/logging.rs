use std::fs;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub enable_console: bool,
    pub enable_file: bool,
    pub log_level: Level,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            enable_console: true,
            enable_file: true,
            log_level: Level::INFO,
        }
    }
}

/// Initializes tracing with a console layer plus daily-rolling file output.
/// The returned guards keep the non-blocking writers alive; hold them for
/// the life of the process.
pub fn init_logging(config: Option<LoggingConfig>) -> anyhow::Result<Vec<WorkerGuard>> {
    let config = config.unwrap_or_default();
    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>> = Vec::new();

    if config.enable_console {
        let console_layer = fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_ansi(true);
        layers.push(Box::new(console_layer));
    }

    if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;

        let all_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "crm-bridge.log");
        let (all_writer, all_guard) = tracing_appender::non_blocking(all_appender);
        guards.push(all_guard);
        layers.push(Box::new(
            fmt::layer()
                .with_writer(all_writer)
                .with_target(true)
                .with_ansi(false),
        ));

        let error_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "error.log");
        let (error_writer, error_guard) = tracing_appender::non_blocking(error_appender);
        guards.push(error_guard);
        layers.push(Box::new(
            fmt::layer()
                .with_writer(error_writer)
                .with_target(true)
                .with_ansi(false)
                .with_filter(tracing_subscriber::filter::LevelFilter::ERROR),
        ));
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "crm_bridge={},rdkafka=warn",
            config.log_level.to_string().to_ascii_lowercase()
        ))
    });

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .init();

    Ok(guards)
}
