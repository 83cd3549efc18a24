use anyhow::{Context, Result};
use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging system. `RUST_LOG` wins over `level`.
pub fn init_logger(level: &str, json_output: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match (json_output, log_file) {
        (true, Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            registry.with(fmt::layer().json().with_writer(file)).try_init()?;
        }
        (true, None) => registry.with(fmt::layer().json()).try_init()?,
        (false, Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(file))
                .try_init()?;
        }
        // Compact keeps per-page progress lines readable in a terminal
        (false, None) => registry.with(fmt::layer().compact()).try_init()?,
    }
    Ok(())
}

/// Initialize logger from config
pub fn init_from_config(config: &crate::utils::config::LoggingConfig) -> Result<()> {
    let json = config.output == "json";
    let log_file = if !config.file_path.is_empty() {
        Some(Path::new(&config.file_path))
    } else {
        None
    };

    init_logger(&config.level, json, log_file)
}
