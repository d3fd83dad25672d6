use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
fn default_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("adaptive_crawler={}", level).parse()?)
        .add_directive("warn".parse()?);
    Ok(filter)
}

/// Install the console logger, plus a plain-text file logger when `log_file` is given
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = default_filter(verbose)?;

    let console = fmt::layer().with_target(true).with_span_events(FmtSpan::CLOSE);

    match log_file {
        Some(log_file) => {
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory: {}", parent.display()))?;
            }

            let file = fs::File::create(&log_file)
                .context(format!("Failed to create log file: {}", log_file.display()))?;
            let file_layer = fmt::layer().with_target(true).with_ansi(false).with_writer(file);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(file_layer)
                .try_init()
                .context("Logging is already initialized")?;
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .try_init()
                .context("Logging is already initialized")?;
        }
    }

    Ok(())
}

pub fn default_log_file() -> PathBuf {
    let mut path = match directories::ProjectDirs::from("com", "adaptive-crawler", "adaptive-crawler") {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => PathBuf::from("./logs"),
    };

    path.push("crawler.log");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_file_name() {
        assert!(default_log_file().ends_with("crawler.log"));
    }

    #[test]
    fn test_filter_directives_parse() {
        assert!(default_filter(true).is_ok());
        assert!(default_filter(false).is_ok());
    }
}
