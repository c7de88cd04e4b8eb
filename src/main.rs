use clap::{Parser, Subcommand};
use tracing::error;

use cdp_relay::cli::{self, serve::ServeArgs};

#[derive(Parser)]
#[command(
    name = "cdp-relay",
    version,
    about = "Relay that exposes a browser-extension debugger attachment as a CDP endpoint"
)]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = cli::init_logging(&cli.log_level) {
        eprintln!("failed to initialise logging: {err:#}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Serve(args) => cli::serve::cmd_serve(args).await,
    };
    if let Err(err) = result {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
}
