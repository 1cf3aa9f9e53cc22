mod agent;
mod cli;
mod cmd;
mod config;
mod hub;
mod sensor;
mod util;

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::cli::Command;
use crate::config::{Config, FleetConfig};

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse().unwrap())
                    .add_directive("hyper=error".parse().unwrap())
                    .add_directive("reqwest=warn".parse().unwrap()),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = cli::parse();

    match cli.command {
        Some(Command::Fleet(args)) => {
            info!("starting fleet maintenance");
            cmd::fleet::run(FleetConfig::from_args(args)?).await
        }
        None => {
            info!("service started");
            let config = Config::from_args(cli.agent)?;
            debug!("{config:#?}");
            cmd::agent::run(config).await
        }
    }
}
