//! copilot-hub - shared conversations and paced exchanges between copilots.

use clap::Parser;
use std::process::ExitCode;

use copilot_hub::config::load_settings_or_default;
use copilot_hub::{logging, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = Commands::parse();

    let settings = load_settings_or_default();

    // Initialize logging; the guard flushes the file writer on exit
    let _guard = match logging::init(settings.logging.filter.as_deref()) {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Run the command
    match args.run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
