/// torrotate - Tor circuit rotation daemon
///
/// Launches Tor, authenticates to its control port and requests a new
/// identity every `--ipLifetime` seconds, logging the resulting exits.

use clap::Parser;
use tracing::error;

use torrotate_daemon::{app, logging, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = app::run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
