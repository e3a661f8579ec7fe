use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    config::{KeeperConfig, LogFormat},
    error::{AppError, AppResult},
};

const DEFAULT_FILTER: &str = "info,inheritance_keeper=debug,tower_http=debug";

/// Initialize logging and tracing.
///
/// `RUST_LOG` wins over the default filter. Output goes to stdout unless a
/// log file is configured.
pub fn init_tracing(config: &KeeperConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = fmt().with_env_filter(filter).with_target(true);

    let result = match (&config.log_file, config.log_format) {
        (Some(path), format) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| AppError::Config(format!("cannot open log file {}: {}", path, e)))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            match format {
                LogFormat::Json => builder.json().try_init(),
                LogFormat::Text => builder.try_init(),
            }
        }
        (None, LogFormat::Json) => builder.json().try_init(),
        (None, LogFormat::Text) => builder.try_init(),
    };

    result.map_err(|e| AppError::Internal(format!("failed to install tracing subscriber: {}", e)))
}
