use std::path::PathBuf;

use clap::Parser;
use smtp_proxy::{config::Config, controller::Controller};

/// Authenticating SMTP proxy that strips identifying headers before relaying.
///
/// Configuration comes from the SMTP_* and LOG_LEVEL environment variables.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML file supplying values for variables the environment leaves unset
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    Controller::new(config).run().await
}
