// Soku - command line entry point

mod cli;

use cli::CliHandler;
use soku_core::utils::SokuError;

#[tokio::main]
async fn main() {
    let handler = CliHandler::new();

    if let Err(e) = handler.run().await {
        // Build failures were already listed in full.
        if !matches!(e, SokuError::Build(_)) {
            eprintln!("❌ Error: {}", e);
        }
        std::process::exit(1);
    }
}
