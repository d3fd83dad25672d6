use adaptive_crawler::cli;
use adaptive_crawler::diagnostics::enable_error_backtraces;
use anyhow::Result;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    enable_error_backtraces();
    let args = cli::parse_args();
    args.init_logging()?;

    info!("Starting adaptive crawler v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
