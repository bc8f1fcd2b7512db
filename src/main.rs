mod cli;

use std::process::ExitCode;

use clap::Parser;
use stockpilot::utils::StockpilotError;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so answers and extracted JSON on stdout stay clean
fn init_logging(verbose: bool) {
    let filter_level = if verbose { Level::DEBUG } else { Level::WARN };

    let filter = EnvFilter::builder()
        .with_default_directive(filter_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::time())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    match cli::Cli::try_parse() {
        Ok(cli) => {
            init_logging(cli.verbose);

            tracing::debug!("Verbose mode enabled");
            tracing::debug!("Starting stockpilot v{}", env!("CARGO_PKG_VERSION"));

            match cli::run(cli).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    let hint = e
                        .chain()
                        .find_map(|cause| cause.downcast_ref::<StockpilotError>())
                        .and_then(StockpilotError::suggestion);
                    if let Some(hint) = hint {
                        eprintln!("Hint: {}", hint);
                    }
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            use clap::error::ErrorKind;

            match e.kind() {
                ErrorKind::DisplayVersion | ErrorKind::DisplayHelp => {
                    e.print().ok();
                    ExitCode::SUCCESS
                }
                ErrorKind::InvalidSubcommand => {
                    let error_message = e.to_string();
                    let cmd = error_message
                        .split('\'')
                        .nth(1)
                        .unwrap_or("unknown");
                    eprintln!("error: unknown command: {}", cmd);
                    eprintln!("\nValid commands are: version, ask, extract, cost, providers, help");
                    ExitCode::FAILURE
                }
                _ => {
                    e.print().ok();
                    ExitCode::from(2)
                }
            }
        }
    }
}
